use loft::error::LowerError;
use loft::func::{Definition, Env, Function};
use loft::ir::{Expr, ScalarType, Stmt};
use loft::lower::schedule_functions;
use loft::lower::validate::validate_fused_group_schedules;
use loft::schedule::{
    Dim, FusedPair, LoopLevel, ReductionVariable, Schedule, Split, TailStrategy,
};
use loft::target::Target;

fn env_of(fs: Vec<Function>) -> Env {
    fs.into_iter().map(|f| (f.name.clone(), f)).collect()
}

fn collect_loops(stmt: &Stmt, out: &mut Vec<String>) {
    if let Stmt::For { var, .. } = stmt {
        out.push(var.name());
    }
    stmt.each_child(&mut |c| collect_loops(c, out));
}

fn collect_lets(stmt: &Stmt, out: &mut Vec<(String, Expr)>) {
    if let Stmt::Let { name, value, .. } = stmt {
        out.push((name.clone(), value.clone()));
    }
    stmt.each_child(&mut |c| collect_lets(c, out));
}

/// A function whose single update iterates a reduction domain
/// `[min, min+extent)` named `r`.
fn reduction_fn(name: &str, min: i64, extent: i64) -> Function {
    let mut f = Function::new(
        name,
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::IntConst(0)],
            vec![Expr::var("x")],
            Schedule::root_over(&["x"]),
        ),
        vec![ScalarType::I32],
    );
    let update_schedule = Schedule::builder()
        .dims(vec![Dim::serial("r"), Dim::outermost()])
        .rvars(vec![ReductionVariable {
            var: "r".to_string(),
            min: Expr::IntConst(min),
            extent: Expr::IntConst(extent),
        }])
        .build();
    f.updates.push(Definition::new(
        vec![Expr::call(name, vec![Expr::IntConst(0)]) + 1],
        vec![Expr::IntConst(0)],
        update_schedule,
    ));
    f
}

fn fused_reduction_pair() -> (Function, Function) {
    let mut f = reduction_fn("f", 0, 10);
    f.updates[0].schedule.fused_pairs.push(FusedPair {
        func_1: "f".to_string(),
        stage_1: 1,
        func_2: "g".to_string(),
        stage_2: 1,
        var: "r".to_string(),
    });
    let mut g = reduction_fn("g", 5, 15);
    g.updates[0].schedule.fuse_level = LoopLevel::at("f", 1, "r");
    (f, g)
}

#[test]
fn fused_reductions_run_over_the_union_of_their_domains() {
    let _ = env_logger::builder().is_test(true).try_init();
    // f iterates [0, 10), g iterates [5, 20); the shared loop must cover
    // [0, 20).
    let (f, g) = fused_reduction_pair();
    let env = env_of(vec![f, g]);
    let out = schedule_functions(
        &["f".to_string(), "g".to_string()],
        &[vec!["f".to_string(), "g".to_string()]],
        &env,
        &Target::host(),
    )
    .unwrap();

    let mut lets = Vec::new();
    collect_lets(&out, &mut lets);
    let find = |name: &str| {
        lets.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| panic!("no binding for {name}"))
    };
    assert_eq!(find("f.s1.fused.r.loop_min"), Expr::IntConst(0));
    assert_eq!(find("f.s1.fused.r.loop_max"), Expr::IntConst(19));
    assert_eq!(find("f.s1.fused.r.loop_extent"), Expr::IntConst(20));

    // The child's loop collapses to one iteration at the parent's
    // position.
    assert_eq!(find("g.s1.fused.r.loop_extent"), Expr::IntConst(1));
    assert_eq!(find("g.s1.fused.r.loop_min"), Expr::var("f.s1.fused.r"));

    let mut loops = Vec::new();
    collect_loops(&out, &mut loops);
    let parent = loops
        .iter()
        .position(|l| l == "f.s1.fused.r")
        .expect("widened parent loop");
    let child = loops
        .iter()
        .position(|l| l == "g.s1.fused.r")
        .expect("collapsed child loop");
    assert!(parent < child);
}

#[test]
fn fused_bodies_are_guarded_to_their_own_domains() {
    let _ = env_logger::builder().is_test(true).try_init();
    let (f, g) = fused_reduction_pair();
    let env = env_of(vec![f, g]);
    let out = schedule_functions(
        &["f".to_string(), "g".to_string()],
        &[vec!["f".to_string(), "g".to_string()]],
        &env,
        &Target::host(),
    )
    .unwrap();

    // Each fused body carries likely() guards against its own bounds.
    fn count_guards(stmt: &Stmt, n: &mut usize) {
        if let Stmt::IfThenElse { cond, .. } = stmt {
            if matches!(cond, Expr::Likely(_)) {
                *n += 1;
            }
        }
        stmt.each_child(&mut |c| count_guards(c, n));
    }
    let mut guards = 0;
    count_guards(&out, &mut guards);
    assert_eq!(guards, 4);
}

fn split_stage_fn(name: &str, init_factor: i64, update_factor: i64) -> Function {
    let dims = || vec![Dim::serial("xi"), Dim::serial("xo"), Dim::outermost()];
    let splits = |factor: i64| {
        vec![Split::split(
            "x",
            "xo",
            "xi",
            factor,
            TailStrategy::GuardWithIf,
        )]
    };
    let mut f = Function::new(
        name,
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::IntConst(0)],
            vec![Expr::var("x")],
            Schedule::builder()
                .dims(dims())
                .splits(splits(init_factor))
                .compute_level(LoopLevel::Root)
                .store_level(LoopLevel::Root)
                .fused_pairs(vec![FusedPair {
                    func_1: name.to_string(),
                    stage_1: 0,
                    func_2: name.to_string(),
                    stage_2: 1,
                    var: "xo".to_string(),
                }])
                .build(),
        ),
        vec![ScalarType::I32],
    );
    f.updates.push(Definition::new(
        vec![Expr::call(name, vec![Expr::var("x")]) + 1],
        vec![Expr::var("x")],
        Schedule::builder()
            .dims(dims())
            .splits(splits(update_factor))
            .fuse_level(LoopLevel::at(name, 0, "xo"))
            .build(),
    ));
    f
}

#[test]
fn stages_of_one_function_fuse_over_the_union_of_their_bounds() {
    let _ = env_logger::builder().is_test(true).try_init();
    // f's update is computed with f's initial stage over x; the shared
    // loop must cover the ranges both stages require.
    let mut f = Function::new(
        "f",
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::IntConst(0)],
            vec![Expr::var("x")],
            Schedule::root_over(&["x"]),
        ),
        vec![ScalarType::I32],
    );
    f.init.schedule.fused_pairs.push(FusedPair {
        func_1: "f".to_string(),
        stage_1: 0,
        func_2: "f".to_string(),
        stage_2: 1,
        var: "x".to_string(),
    });
    f.updates.push(Definition::new(
        vec![Expr::call("f", vec![Expr::var("x")]) + 1],
        vec![Expr::var("x")],
        Schedule::builder()
            .dims(vec![Dim::serial("x"), Dim::outermost()])
            .fuse_level(LoopLevel::at("f", 0, "x"))
            .build(),
    ));
    let env = env_of(vec![f]);
    let out = schedule_functions(
        &["f".to_string()],
        &[vec!["f".to_string()]],
        &env,
        &Target::host(),
    )
    .unwrap();

    let mut lets = Vec::new();
    collect_lets(&out, &mut lets);
    let find = |name: &str| {
        lets.iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.clone())
            .unwrap_or_else(|| panic!("no binding for {name}"))
    };
    // The widened loop takes the update stage's range into account.
    assert_eq!(
        find("f.s0.fused.x.loop_min"),
        Expr::var("f.s0.x.min").min(Expr::var("f.s1.x.min"))
    );
    // The update runs once per shared iteration, at its position.
    assert_eq!(find("f.s1.fused.x.loop_extent"), Expr::IntConst(1));
    assert_eq!(find("f.s1.fused.x.loop_min"), Expr::var("f.s0.fused.x"));
}

#[test]
fn same_function_stages_with_identical_splits_can_fuse() {
    let f = split_stage_fn("f", 8, 8);
    let env = env_of(vec![f.clone()]);
    validate_fused_group_schedules(&[&f], &env).unwrap();
}

#[test]
fn same_function_stages_with_different_splits_cannot_fuse() {
    let f = split_stage_fn("f", 8, 4);
    let env = env_of(vec![f.clone()]);
    let err = validate_fused_group_schedules(&[&f], &env).unwrap_err();
    assert!(matches!(err, LowerError::FusedSplitMismatch { .. }));
}

#[test]
fn shift_inwards_between_stages_of_one_function_is_rejected() {
    let mut f = split_stage_fn("f", 8, 8);
    f.init.schedule.splits[0].tail = TailStrategy::ShiftInwards;
    f.updates[0].schedule.splits[0].tail = TailStrategy::ShiftInwards;
    let env = env_of(vec![f.clone()]);
    let err = validate_fused_group_schedules(&[&f], &env).unwrap_err();
    assert!(matches!(err, LowerError::FusedShiftInwards { .. }));
}

/// A split-up function with a ShiftInwards tail, fusable at `xo`.
fn shifted_fn(name: &str) -> Function {
    Function::new(
        name,
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::var("x")],
            vec![Expr::var("x")],
            Schedule::builder()
                .dims(vec![Dim::serial("xi"), Dim::serial("xo"), Dim::outermost()])
                .splits(vec![Split::split(
                    "x",
                    "xo",
                    "xi",
                    8,
                    TailStrategy::ShiftInwards,
                )])
                .compute_level(LoopLevel::Root)
                .store_level(LoopLevel::Root)
                .build(),
        ),
        vec![ScalarType::I32],
    )
}

#[test]
fn shift_inwards_across_functions_is_allowed() {
    // Distinct functions have distinct storage, so a shifted tail only
    // revisits the function's own sites and stays legal under fusion.
    let mut f = shifted_fn("f");
    f.init.schedule.fused_pairs.push(FusedPair {
        func_1: "f".to_string(),
        stage_1: 0,
        func_2: "g".to_string(),
        stage_2: 0,
        var: "xo".to_string(),
    });
    let mut g = shifted_fn("g");
    g.init.schedule.fuse_level = LoopLevel::at("f", 0, "xo");
    let env = env_of(vec![f.clone(), g.clone()]);
    validate_fused_group_schedules(&[&f, &g], &env).unwrap();
}

#[test]
fn output_scheduled_below_root_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut f = Function::new(
        "f",
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::var("x")],
            vec![Expr::var("x")],
            Schedule::root_over(&["x"]),
        ),
        vec![ScalarType::F32],
    );
    f.init.schedule.compute_level = LoopLevel::at("g", 0, "x");
    f.init.schedule.store_level = LoopLevel::at("g", 0, "x");
    let env = env_of(vec![f]);
    let err = schedule_functions(
        &["f".to_string()],
        &[vec!["f".to_string()]],
        &env,
        &Target::host(),
    )
    .unwrap_err();
    assert!(matches!(err, LowerError::OutputNotRoot { .. }));
}

#[test]
fn storage_shared_across_a_parallel_loop_is_rejected() {
    let _ = env_logger::builder().is_test(true).try_init();
    let g = Function::new(
        "g",
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::var("x") * 2],
            vec![Expr::var("x")],
            Schedule::builder()
                .dims(vec![Dim::serial("x"), Dim::outermost()])
                .compute_level(LoopLevel::at("f", 0, "x"))
                .store_level(LoopLevel::Root)
                .build(),
        ),
        vec![ScalarType::F32],
    );
    let mut f = Function::new(
        "f",
        vec!["x".to_string()],
        Definition::new(
            vec![Expr::call("g", vec![Expr::var("x")])],
            vec![Expr::var("x")],
            Schedule::root_over(&["x"]),
        ),
        vec![ScalarType::F32],
    );
    f.init.schedule.dims[0] = Dim::parallel("x");
    let env = env_of(vec![g, f]);
    let err = schedule_functions(
        &["f".to_string()],
        &[vec!["g".to_string()], vec!["f".to_string()]],
        &env,
        &Target::host(),
    )
    .unwrap_err();
    assert!(matches!(err, LowerError::StorageRacesOnParallelLoop { .. }));
}
