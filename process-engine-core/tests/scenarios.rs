use process_engine_core::config::EngineConfig;
use process_engine_core::connector::{ConnectorRegistry, FnConnector};
use process_engine_core::context::ProcessEngineContext;
use process_engine_core::correlation::{CorrelationOutcome, MessageInstance};
use process_engine_core::definition::*;
use process_engine_core::events::EngineEvent;
use process_engine_core::expression::{ArithmeticOp, CompareOp, Expression};
use process_engine_core::logging::init_tracing;
use process_engine_core::query::QueryOptions;
use process_engine_core::scheduler::MemoryScheduler;
use process_engine_core::store::{ProcessStore, WorkUnit};
use process_engine_core::types::*;
use process_engine_core::{EngineError, ProcessEngine};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

// ─── Helpers ──────────────────────────────────────────────────

async fn live_named(engine: &ProcessEngine, pid: InstanceId, name: &str) -> Vec<FlowNodeInstance> {
    engine
        .live_flow_nodes(pid)
        .await
        .unwrap()
        .into_iter()
        .filter(|n| n.name == name && n.is_live())
        .collect()
}

async fn one_live(engine: &ProcessEngine, pid: InstanceId, name: &str) -> FlowNodeInstance {
    let mut nodes = live_named(engine, pid, name).await;
    assert_eq!(nodes.len(), 1, "expected one live '{name}'");
    nodes.remove(0)
}

async fn events(engine: &ProcessEngine, pid: InstanceId) -> Vec<EngineEvent> {
    engine
        .read_events(pid, 0)
        .await
        .unwrap()
        .into_iter()
        .map(|(_, e)| e)
        .collect()
}

fn fired_count(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::GatewayFired { .. }))
        .count()
}

fn created_count(events: &[EngineEvent], name: &str) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::FlowNodeCreated { name: n, .. } if n == name))
        .count()
}

/// Tokens created minus tokens deleted according to the audit log.
fn logged_token_balance(events: &[EngineEvent]) -> i64 {
    events.iter().fold(0, |acc, e| match e {
        EngineEvent::TokensCreated { count, .. } => acc + i64::from(*count),
        EngineEvent::TokensDeleted { count, .. } | EngineEvent::ScopeTokensCleared { count, .. } => {
            acc - i64::from(*count)
        }
        _ => acc,
    })
}

fn spawned_count(events: &[EngineEvent]) -> usize {
    events
        .iter()
        .filter(|e| matches!(e, EngineEvent::MultiInstanceChildSpawned { .. }))
        .count()
}

/// An engine over the same stores that stops after `steps` work items.
fn limited(ctx: &ProcessEngineContext, steps: usize) -> ProcessEngine {
    ProcessEngine::new(ProcessEngineContext {
        config: Arc::new(EngineConfig {
            max_steps_per_drive: steps,
            ..EngineConfig::default()
        }),
        ..ctx.clone()
    })
}

async fn archived_state(engine: &ProcessEngine, pid: InstanceId) -> ProcessState {
    engine
        .archived_process_instance(pid)
        .await
        .unwrap()
        .expect("process archived")
        .source
        .state
}

fn data(pairs: &[(&str, serde_json::Value)]) -> DataMap {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

// ─── Scenario A: parallel split and join ──────────────────────

struct ParallelJoin {
    definition: ProcessDefinition,
    a_to_join: TransitionId,
}

fn parallel_join() -> ParallelJoin {
    let mut b = ProcessDefinitionBuilder::new("parallel", "1");
    let start = b.start_event("start");
    let fork = b.gateway("fork", GatewayType::Parallel);
    let a = b.user_task("a");
    let bb = b.user_task("b");
    let join = b.gateway("join", GatewayType::Parallel);
    let after = b.user_task("after");
    let end = b.end_event("end");
    b.transition(start, fork);
    b.transition(fork, a);
    b.transition(fork, bb);
    let a_to_join = b.transition(a, join);
    b.transition(bb, join);
    b.transition(join, after);
    b.transition(after, end);
    ParallelJoin {
        definition: b.build().unwrap(),
        a_to_join,
    }
}

#[tokio::test]
async fn test_scenario_a_parallel_join_fires_once() {
    init_tracing(&EngineConfig::default().logging);
    let engine = ProcessEngine::in_memory();
    let ParallelJoin {
        definition,
        a_to_join,
    } = parallel_join();
    let def_id = engine.deploy(definition).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 2);

    let a = one_live(&engine, pid, "a").await;
    engine.execute_flow_node(a.id, DataMap::new()).await.unwrap();

    let join = one_live(&engine, pid, "join").await;
    let gateway = join.gateway().unwrap();
    assert!(!gateway.fired);
    assert_eq!(gateway.hit_by, vec![a_to_join]);
    assert!(!engine.gateways().check_merging_condition(join.id).await.unwrap());
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 2);

    // A replayed hit must not count twice.
    let err = engine
        .gateways()
        .hit_transition(join.id, a_to_join)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Modification(_)));

    let b = one_live(&engine, pid, "b").await;
    engine.execute_flow_node(b.id, DataMap::new()).await.unwrap();

    let log = events(&engine, pid).await;
    assert_eq!(fired_count(&log), 1);
    assert_eq!(created_count(&log, "after"), 1);
    assert!(live_named(&engine, pid, "join").await.is_empty());
    one_live(&engine, pid, "after").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    assert_eq!(logged_token_balance(&log), 1);

    let after = one_live(&engine, pid, "after").await;
    engine.execute_flow_node(after.id, DataMap::new()).await.unwrap();
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 0);
    assert_eq!(logged_token_balance(&events(&engine, pid).await), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_arrivals_fire_join_exactly_once() {
    for _ in 0..20 {
        let engine = Arc::new(ProcessEngine::in_memory());
        let def_id = engine.deploy(parallel_join().definition).await.unwrap();
        let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
        let a = one_live(&engine, pid, "a").await;
        let b = one_live(&engine, pid, "b").await;

        let first = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_flow_node(a.id, DataMap::new()).await })
        };
        let second = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.execute_flow_node(b.id, DataMap::new()).await })
        };
        first.await.unwrap().unwrap();
        second.await.unwrap().unwrap();

        let log = events(&engine, pid).await;
        assert_eq!(fired_count(&log), 1);
        assert_eq!(live_named(&engine, pid, "after").await.len(), 1);
        assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    }
}

#[tokio::test]
async fn test_exclusive_join_passes_every_token() {
    let mut b = ProcessDefinitionBuilder::new("xor-merge", "1");
    let start = b.start_event("start");
    let fork = b.gateway("fork", GatewayType::Parallel);
    let a = b.automatic_task("a");
    let bb = b.automatic_task("b");
    let merge = b.gateway("merge", GatewayType::Exclusive);
    let after = b.user_task("after");
    let end = b.end_event("end");
    b.transition(start, fork);
    b.transition(fork, a);
    b.transition(fork, bb);
    b.transition(a, merge);
    b.transition(bb, merge);
    b.transition(merge, after);
    b.transition(after, end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let log = events(&engine, pid).await;
    // The fork fires once and the merge once per arriving token.
    assert_eq!(fired_count(&log), 3);
    assert_eq!(live_named(&engine, pid, "after").await.len(), 2);
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 2);
}

// ─── Scenario B: inclusive join ───────────────────────────────

#[tokio::test]
async fn test_scenario_b_inclusive_join_skips_dead_branch() {
    let mut b = ProcessDefinitionBuilder::new("inclusive", "1");
    let start = b.start_event("start");
    let choice = b.gateway("choice", GatewayType::Exclusive);
    let a = b.user_task("a");
    let bb = b.user_task("b");
    let join = b.gateway("join", GatewayType::Inclusive);
    let after = b.user_task("after");
    let end = b.end_event("end");
    b.transition(start, choice);
    b.conditional_transition(choice, a, Expression::data_equals("route", "a"));
    b.default_transition(choice, bb);
    b.transition(a, join);
    b.transition(bb, join);
    b.transition(join, after);
    b.transition(after, end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine
        .start_process(def_id, None, data(&[("route", json!("a"))]))
        .await
        .unwrap();
    assert!(live_named(&engine, pid, "b").await.is_empty());

    let a = one_live(&engine, pid, "a").await;
    engine.execute_flow_node(a.id, DataMap::new()).await.unwrap();

    let log = events(&engine, pid).await;
    assert!(live_named(&engine, pid, "join").await.is_empty());
    one_live(&engine, pid, "after").await;
    // choice and join
    assert_eq!(fired_count(&log), 2);
}

#[tokio::test]
async fn test_inclusive_join_waits_for_live_branch() {
    let mut b = ProcessDefinitionBuilder::new("inclusive-both", "1");
    let start = b.start_event("start");
    let split = b.gateway("split", GatewayType::Inclusive);
    let a = b.user_task("a");
    let bb = b.user_task("b");
    let join = b.gateway("join", GatewayType::Inclusive);
    let end = b.end_event("end");
    b.transition(start, split);
    b.conditional_transition(split, a, Expression::constant(true));
    b.conditional_transition(split, bb, Expression::constant(true));
    b.transition(a, join);
    b.transition(bb, join);
    b.transition(join, end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let a = one_live(&engine, pid, "a").await;
    engine.execute_flow_node(a.id, DataMap::new()).await.unwrap();
    let waiting = one_live(&engine, pid, "join").await;
    assert!(!engine.gateways().check_merging_condition(waiting.id).await.unwrap());
    assert!(engine
        .gateways()
        .get_inclusive_gateways_of_process_instance_that_should_fire(pid)
        .await
        .unwrap()
        .is_empty());

    let b = one_live(&engine, pid, "b").await;
    engine.execute_flow_node(b.id, DataMap::new()).await.unwrap();
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    // split and join
    assert_eq!(fired_count(&events(&engine, pid).await), 2);
}

#[tokio::test]
async fn test_inclusive_join_fires_when_other_branch_is_aborted() {
    let mut b = ProcessDefinitionBuilder::new("inclusive-abort", "1");
    let start = b.start_event("start");
    let split = b.gateway("split", GatewayType::Parallel);
    let a = b.user_task("a");
    let bb = b.user_task("b");
    let join = b.gateway("join", GatewayType::Inclusive);
    let after = b.user_task("after");
    let end = b.end_event("end");
    b.transition(start, split);
    b.transition(split, a);
    b.transition(split, bb);
    b.transition(a, join);
    b.transition(bb, join);
    b.transition(join, after);
    b.transition(after, end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let a = one_live(&engine, pid, "a").await;
    engine.execute_flow_node(a.id, DataMap::new()).await.unwrap();
    assert!(live_named(&engine, pid, "after").await.is_empty());

    // Once the other branch is gone the join no longer waits for it.
    let b = one_live(&engine, pid, "b").await;
    engine.abort_flow_node(b.id).await.unwrap();
    one_live(&engine, pid, "after").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
}

// ─── Scenario C: multi-instance ───────────────────────────────

fn multi_instance(completion: Option<Expression>, cardinality: u32) -> ProcessDefinition {
    let mut b = ProcessDefinitionBuilder::new("approvals", "1");
    let start = b.start_event("start");
    let approve = b.user_task("approve");
    let end = b.end_event("end");
    b.transition(start, approve);
    b.transition(approve, end);
    b.loop_characteristics(
        approve,
        LoopCharacteristics::MultiInstance(MultiInstanceLoop {
            cardinality: Some(Expression::constant(cardinality)),
            completion_condition: completion,
            ..MultiInstanceLoop::default()
        }),
    );
    b.build().unwrap()
}

fn counters(node: &FlowNodeInstance) -> MultiInstanceCounters {
    match &node.detail {
        InstanceDetail::MultiInstance(c) => c.clone(),
        other => panic!("not a multi-instance wrapper: {other:?}"),
    }
}

#[tokio::test]
async fn test_scenario_c_multi_instance_counts_terminated_children() {
    let engine = ProcessEngine::in_memory();
    let def_id = engine
        .deploy(multi_instance(Some(Expression::constant(false)), 5))
        .await
        .unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let nodes = live_named(&engine, pid, "approve").await;
    let wrapper = nodes.iter().find(|n| n.is_wrapper()).unwrap().clone();
    let mut children: Vec<FlowNodeInstance> = nodes.into_iter().filter(|n| n.is_loop_child()).collect();
    children.sort_by_key(|c| c.loop_index);
    assert_eq!(children.len(), 5);
    assert_eq!(engine.tokens().get_number_of_tokens_in_scope(pid, wrapper.id).await.unwrap(), 5);

    for child in &children[..3] {
        engine.execute_flow_node(child.id, DataMap::new()).await.unwrap();
    }
    engine.abort_flow_node(children[3].id).await.unwrap();

    let c = counters(&engine.flow_node(wrapper.id).await.unwrap().unwrap());
    assert_eq!((c.total, c.active, c.completed, c.terminated), (5, 1, 3, 1));
    assert_eq!(c.active + c.completed + c.terminated, c.total);
    assert!(engine.process_instance(pid).await.unwrap().is_some());

    engine.abort_flow_node(children[4].id).await.unwrap();

    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let wrappers: Vec<_> = archived.iter().filter(|a| a.source.id == wrapper.id).collect();
    assert_eq!(wrappers.len(), 1);
    let c = counters(&wrappers[0].source);
    assert_eq!((c.active, c.completed, c.terminated), (0, 3, 2));
    assert_eq!(wrappers[0].source.state, FlowNodeState::Completed);
}

#[tokio::test]
async fn test_completion_condition_cancels_remaining_children() {
    let condition = Expression::compare(
        Expression::data("nrOfCompletedInstances"),
        CompareOp::Gte,
        Expression::constant(2),
    );
    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(multi_instance(Some(condition), 3)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let mut children: Vec<FlowNodeInstance> = live_named(&engine, pid, "approve")
        .await
        .into_iter()
        .filter(|n| n.is_loop_child())
        .collect();
    children.sort_by_key(|c| c.loop_index);
    engine.execute_flow_node(children[0].id, DataMap::new()).await.unwrap();
    engine.execute_flow_node(children[1].id, DataMap::new()).await.unwrap();

    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let third = archived.iter().find(|a| a.source.id == children[2].id).unwrap();
    assert_eq!(third.source.state, FlowNodeState::Cancelled);
    let wrapper = archived.iter().find(|a| a.source.is_wrapper()).unwrap();
    let c = counters(&wrapper.source);
    assert_eq!((c.completed, c.terminated, c.active), (2, 1, 0));
}

#[tokio::test]
async fn test_sequential_multi_instance_collects_outputs() {
    let mut b = ProcessDefinitionBuilder::new("double", "1");
    b.initial_data("items", json!([1, 2, 3]));
    let start = b.start_event("start");
    let double = b.automatic_task("double");
    let end = b.end_event("end");
    b.transition(start, double);
    b.transition(double, end);
    b.operation(
        double,
        "doubled",
        Expression::arithmetic(Expression::data("item"), ArithmeticOp::Mul, Expression::constant(2)),
    );
    b.loop_characteristics(
        double,
        LoopCharacteristics::MultiInstance(MultiInstanceLoop {
            sequential: true,
            input_collection: Some("items".into()),
            input_item: Some("item".into()),
            output_item: Some("doubled".into()),
            output_collection: Some("results".into()),
            ..MultiInstanceLoop::default()
        }),
    );

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let archived = engine.archived_process_instance(pid).await.unwrap().unwrap();
    assert_eq!(archived.source.state, ProcessState::Completed);
    assert_eq!(archived.source.data["results"], json!([2, 4, 6]));
    assert!(!archived.source.data.contains_key("doubled"));
}

#[tokio::test]
async fn test_standard_loop_repeats_while_condition_holds() {
    let mut b = ProcessDefinitionBuilder::new("retry-loop", "1");
    b.initial_data("attempts", json!(0));
    let start = b.start_event("start");
    let attempt = b.automatic_task("attempt");
    let end = b.end_event("end");
    b.transition(start, attempt);
    b.transition(attempt, end);
    b.operation(
        attempt,
        "attempts",
        Expression::arithmetic(Expression::data("attempts"), ArithmeticOp::Add, Expression::constant(1)),
    );
    b.loop_characteristics(
        attempt,
        LoopCharacteristics::Standard(StandardLoop {
            condition: Expression::compare(Expression::data("attempts"), CompareOp::Lt, Expression::constant(3)),
            test_before: false,
            loop_max: Some(10),
        }),
    );

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let archived = engine.archived_process_instance(pid).await.unwrap().unwrap();
    assert_eq!(archived.source.data["attempts"], json!(3));
    assert_eq!(spawned_count(&events(&engine, pid).await), 3);
}

/// `approve` runs as a multi-instance user task and hands over to `after`.
fn approvals_then_after(mi: MultiInstanceLoop, initial: Option<(&str, serde_json::Value)>) -> ProcessDefinition {
    let mut b = ProcessDefinitionBuilder::new("approvals-then-after", "1");
    if let Some((name, value)) = initial {
        b.initial_data(name, value);
    }
    let start = b.start_event("start");
    let approve = b.user_task("approve");
    let after = b.user_task("after");
    let end = b.end_event("end");
    b.transition(start, approve);
    b.transition(approve, after);
    b.transition(after, end);
    b.loop_characteristics(approve, LoopCharacteristics::MultiInstance(mi));
    b.build().unwrap()
}

async fn assert_empty_multi_instance_passes_through(engine: &ProcessEngine, pid: InstanceId) {
    let log = events(engine, pid).await;
    assert_eq!(spawned_count(&log), 0);
    assert!(live_named(engine, pid, "approve").await.is_empty());
    one_live(engine, pid, "after").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    assert_eq!(logged_token_balance(&log), 1);

    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let approvals: Vec<_> = archived.iter().filter(|a| a.source.name == "approve").collect();
    assert_eq!(approvals.len(), 1);
    assert!(approvals[0].source.is_wrapper());
    assert_eq!(approvals[0].source.state, FlowNodeState::Completed);
    let c = counters(&approvals[0].source);
    assert_eq!((c.total, c.active, c.completed, c.terminated), (0, 0, 0, 0));
}

#[tokio::test]
async fn test_zero_cardinality_multi_instance_completes_at_once() {
    let engine = ProcessEngine::in_memory();
    let mi = MultiInstanceLoop {
        cardinality: Some(Expression::constant(0)),
        ..MultiInstanceLoop::default()
    };
    let def_id = engine.deploy(approvals_then_after(mi, None)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    assert_empty_multi_instance_passes_through(&engine, pid).await;
}

#[tokio::test]
async fn test_empty_input_collection_completes_at_once() {
    let engine = ProcessEngine::in_memory();
    let mi = MultiInstanceLoop {
        input_collection: Some("items".into()),
        input_item: Some("item".into()),
        output_item: Some("verdict".into()),
        output_collection: Some("verdicts".into()),
        ..MultiInstanceLoop::default()
    };
    let def_id = engine
        .deploy(approvals_then_after(mi, Some(("items", json!([])))))
        .await
        .unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    assert_empty_multi_instance_passes_through(&engine, pid).await;
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.data["verdicts"], json!([]));
}

// ─── Scenario D: boundary timer ───────────────────────────────

fn review_with_timeout(interrupting: bool) -> ProcessDefinition {
    let mut b = ProcessDefinitionBuilder::new("review", "1");
    let start = b.start_event("start");
    let review = b.user_task("review");
    let end = b.end_event("end");
    let timeout = b.boundary_event(review, "timeout", EventTrigger::Timer { duration_ms: 1000 }, interrupting);
    let escalate = b.user_task("escalate");
    let escalated = b.end_event("escalated");
    b.transition(start, review);
    b.transition(review, end);
    b.transition(timeout, escalate);
    b.transition(escalate, escalated);
    b.build().unwrap()
}

fn timer_engine() -> (ProcessEngine, Arc<MemoryScheduler>) {
    let scheduler = Arc::new(MemoryScheduler::new());
    let ctx = ProcessEngineContext::in_memory(EngineConfig::default()).with_scheduler(scheduler.clone());
    (ProcessEngine::new(ctx), scheduler)
}

#[tokio::test]
async fn test_scenario_d_timer_interrupts_user_task() {
    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(review_with_timeout(true)).await.unwrap();
    let before = now_ms();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let review = one_live(&engine, pid, "review").await;
    let boundary = one_live(&engine, pid, "timeout").await;
    assert_eq!(boundary.attached_to, Some(review.id));
    let jobs = scheduler.pending_jobs().await;
    assert_eq!(jobs.len(), 1);
    assert!(jobs[0].due_at >= before + 1000);
    assert!(scheduler.due_jobs(before).await.is_empty());

    let outcome = engine.fire_timer(&jobs[0].job_id).await.unwrap();
    assert!(matches!(
        outcome,
        CorrelationOutcome::Delivered { flow_node_instance_id: Some(id), .. } if id == boundary.id
    ));
    assert!(live_named(&engine, pid, "review").await.is_empty());
    one_live(&engine, pid, "escalate").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    assert!(scheduler.pending_jobs().await.is_empty());

    let aborted = engine.archived_flow_node_instances(pid).await.unwrap();
    let review_snapshot = aborted.iter().find(|a| a.source.id == review.id).unwrap();
    assert_eq!(review_snapshot.source.state, FlowNodeState::Aborted);

    let err = engine.execute_flow_node(review.id, DataMap::new()).await.unwrap_err();
    assert!(err.is_not_found());
    let again = engine.fire_timer(&jobs[0].job_id).await.unwrap();
    assert_eq!(again, CorrelationOutcome::NotDelivered);
}

#[tokio::test]
async fn test_scenario_d_timer_after_completion_is_a_no_op() {
    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(review_with_timeout(true)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let job_id = scheduler.pending_jobs().await[0].job_id.clone();

    let review = one_live(&engine, pid, "review").await;
    engine.execute_flow_node(review.id, DataMap::new()).await.unwrap();
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    assert!(scheduler.pending_jobs().await.is_empty());

    let outcome = engine.fire_timer(&job_id).await.unwrap();
    assert_eq!(outcome, CorrelationOutcome::NotDelivered);
    assert!(created_count(&events(&engine, pid).await, "escalate") == 0);
}

#[tokio::test]
async fn test_non_interrupting_timer_forks_a_branch() {
    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(review_with_timeout(false)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let job_id = scheduler.pending_jobs().await[0].job_id.clone();

    assert!(engine.fire_timer(&job_id).await.unwrap().is_delivered());
    let review = one_live(&engine, pid, "review").await;
    let escalate = one_live(&engine, pid, "escalate").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 2);

    engine.execute_flow_node(review.id, DataMap::new()).await.unwrap();
    assert!(engine.process_instance(pid).await.unwrap().is_some());
    engine.execute_flow_node(escalate.id, DataMap::new()).await.unwrap();
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
}

// ─── Scenario E: message correlation ──────────────────────────

fn payment_process() -> ProcessDefinition {
    let mut b = ProcessDefinitionBuilder::new("payment", "1");
    let start = b.start_event("start");
    let wait = b.catch_event(
        "wait for payment",
        EventTrigger::Message(MessageTrigger {
            message_name: "payment".into(),
            correlations: vec![CorrelationDefinition {
                key: "orderId".into(),
                value: Expression::data("orderId"),
            }],
            data_mappings: BTreeMap::from([("amount".to_string(), "paid".to_string())]),
        }),
    );
    let ship = b.user_task("ship");
    let end = b.end_event("end");
    b.transition(start, wait);
    b.transition(wait, ship);
    b.transition(ship, end);
    b.build().unwrap()
}

#[tokio::test]
async fn test_scenario_e_only_matching_subscription_is_consumed() {
    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(payment_process()).await.unwrap();
    let first = engine
        .start_process(def_id, None, data(&[("orderId", json!(1))]))
        .await
        .unwrap();
    let second = engine
        .start_process(def_id, None, data(&[("orderId", json!(2))]))
        .await
        .unwrap();
    assert_eq!(engine.search_waiting_events(&QueryOptions::default()).await.unwrap().len(), 2);

    let message = MessageInstance::new("payment")
        .correlate("orderId", 2)
        .with_payload("amount", 40);
    match engine.send_message(message.clone()).await.unwrap() {
        CorrelationOutcome::Delivered {
            process_instance_id, ..
        } => assert_eq!(process_instance_id, second),
        other => panic!("expected delivery, got {other:?}"),
    }

    one_live(&engine, second, "ship").await;
    let process = engine.process_instance(second).await.unwrap().unwrap();
    assert_eq!(process.data["paid"], json!(40));

    let remaining = engine
        .search_waiting_events(&QueryOptions::default().filter("process_instance_id", first))
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    one_live(&engine, first, "wait for payment").await;

    // Consumed once: the same message finds nothing to deliver to.
    assert_eq!(engine.send_message(message).await.unwrap(), CorrelationOutcome::NotDelivered);
    let unknown = MessageInstance::new("payment").correlate("orderId", 3);
    assert_eq!(engine.send_message(unknown).await.unwrap(), CorrelationOutcome::NotDelivered);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_messages_consume_subscription_once() {
    let engine = Arc::new(ProcessEngine::in_memory());
    let def_id = engine.deploy(payment_process()).await.unwrap();
    let pid = engine
        .start_process(def_id, None, data(&[("orderId", json!(7))]))
        .await
        .unwrap();

    let sends: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move {
                engine
                    .send_message(MessageInstance::new("payment").correlate("orderId", 7))
                    .await
            })
        })
        .collect();
    let mut delivered = 0;
    for send in sends {
        if send.await.unwrap().unwrap().is_delivered() {
            delivered += 1;
        }
    }
    assert_eq!(delivered, 1);
    assert_eq!(live_named(&engine, pid, "ship").await.len(), 1);
}

#[tokio::test]
async fn test_message_start_event_stays_subscribed() {
    let mut b = ProcessDefinitionBuilder::new("orders", "1");
    let start = b.add_node(
        "order placed",
        FlowNodeKind::StartEvent {
            trigger: Some(EventTrigger::Message(MessageTrigger {
                message_name: "order-placed".into(),
                correlations: Vec::new(),
                data_mappings: BTreeMap::from([("id".to_string(), "orderId".to_string())]),
            })),
        },
    );
    let handle = b.user_task("handle");
    let end = b.end_event("end");
    b.transition(start, handle);
    b.transition(handle, end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();

    let mut started = Vec::new();
    for id in [10, 11] {
        let outcome = engine
            .send_message(MessageInstance::new("order-placed").with_payload("id", id))
            .await
            .unwrap();
        let CorrelationOutcome::Delivered {
            process_instance_id, ..
        } = outcome
        else {
            panic!("message start not delivered");
        };
        started.push(process_instance_id);
    }
    assert_ne!(started[0], started[1]);
    let process = engine.process_instance(started[1]).await.unwrap().unwrap();
    assert_eq!(process.data["orderId"], json!(11));

    engine.disable_definition(def_id).await.unwrap();
    let outcome = engine
        .send_message(MessageInstance::new("order-placed"))
        .await
        .unwrap();
    assert_eq!(outcome, CorrelationOutcome::NotDelivered);
}

#[tokio::test]
async fn test_thrown_message_reaches_other_process() {
    let engine = ProcessEngine::in_memory();
    let receiver = engine.deploy(payment_process()).await.unwrap();
    let waiting = engine
        .start_process(receiver, None, data(&[("orderId", json!(5))]))
        .await
        .unwrap();

    let mut b = ProcessDefinitionBuilder::new("checkout", "1");
    let start = b.start_event("start");
    let end = b.add_node(
        "paid",
        FlowNodeKind::EndEvent {
            result: EndEventResult::Message(MessageThrow {
                message_name: "payment".into(),
                target_process: Some("payment".into()),
                target_flow_node: None,
                correlations: vec![CorrelationDefinition {
                    key: "orderId".into(),
                    value: Expression::data("order"),
                }],
                payload: BTreeMap::from([("amount".to_string(), Expression::data("total"))]),
            }),
        },
    );
    b.transition(start, end);
    let sender = engine.deploy(b.build().unwrap()).await.unwrap();
    let checkout = engine
        .start_process(sender, None, data(&[("order", json!(5)), ("total", json!(99))]))
        .await
        .unwrap();

    assert_eq!(archived_state(&engine, checkout).await, ProcessState::Completed);
    assert!(events(&engine, checkout)
        .await
        .contains(&EngineEvent::MessageSent {
            message_name: "payment".into(),
            delivered: true,
        }));
    one_live(&engine, waiting, "ship").await;
    let process = engine.process_instance(waiting).await.unwrap().unwrap();
    assert_eq!(process.data["paid"], json!(99));
}

// ─── Sub-processes, errors and termination ────────────────────

fn failing_connector(id: &'static str) -> Arc<ConnectorRegistry> {
    Arc::new(ConnectorRegistry::new(1_000).register(
        id,
        Arc::new(FnConnector::new(|_| Err(anyhow::anyhow!("card declined")))),
    ))
}

fn connector(id: &str, fail_action: FailAction) -> ConnectorDefinition {
    ConnectorDefinition {
        name: id.to_string(),
        connector_id: id.to_string(),
        activation: ConnectorEvent::OnEnter,
        inputs: BTreeMap::new(),
        outputs: BTreeMap::new(),
        fail_action,
    }
}

#[tokio::test]
async fn test_error_is_caught_by_sub_process_boundary() {
    let mut b = ProcessDefinitionBuilder::new("checkout", "1");
    let start = b.start_event("start");
    let payment = b.sub_process("payment");
    let end = b.end_event("end");
    let inner_start = b.start_event("payment start");
    let charge = b.automatic_task("charge");
    let inner_end = b.end_event("payment end");
    for node in [inner_start, charge, inner_end] {
        b.in_container(node, payment);
    }
    b.connector(
        charge,
        connector("card", FailAction::ThrowError { code: "DECLINED".into() }),
    );
    let declined = b.boundary_event(
        payment,
        "declined",
        EventTrigger::Error {
            code: Some("DECLINED".into()),
        },
        true,
    );
    let refund = b.user_task("refund");
    let refunded = b.end_event("refunded");
    b.transition(start, payment);
    b.transition(payment, end);
    b.transition(inner_start, charge);
    b.transition(charge, inner_end);
    b.transition(declined, refund);
    b.transition(refund, refunded);

    let ctx = ProcessEngineContext::in_memory(EngineConfig::default()).with_connectors(failing_connector("card"));
    let engine = ProcessEngine::new(ctx);
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let live: Vec<String> = engine
        .live_flow_nodes(pid)
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    assert_eq!(live, vec!["refund".to_string()]);
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    assert!(events(&engine, pid).await.iter().any(|e| matches!(
        e,
        EngineEvent::ErrorCaught { code, .. } if code == "DECLINED"
    )));
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    for name in ["charge", "payment"] {
        let snapshot = archived.iter().find(|a| a.source.name == name).unwrap();
        assert_eq!(snapshot.source.state, FlowNodeState::Aborted);
    }
    assert!(engine.incidents(pid).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_uncaught_error_raises_incident() {
    let mut b = ProcessDefinitionBuilder::new("uncaught", "1");
    let start = b.start_event("start");
    let fail = b.add_node(
        "fail",
        FlowNodeKind::EndEvent {
            result: EndEventResult::Error { code: "BOOM".into() },
        },
    );
    b.transition(start, fail);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state_category, StateCategory::Error);
    let incidents = engine.incidents(pid).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert!(incidents[0].message.contains("BOOM"));
    let node = one_live(&engine, pid, "fail").await;
    assert_eq!(node.state, FlowNodeState::Failed);
    assert_eq!(incidents[0].flow_node_instance_id, Some(node.id));
}

#[tokio::test]
async fn test_terminate_end_aborts_sub_process_siblings() {
    let mut b = ProcessDefinitionBuilder::new("terminate", "1");
    let start = b.start_event("start");
    let work = b.sub_process("work");
    let after = b.user_task("after");
    let end = b.end_event("end");
    let inner_start = b.start_event("work start");
    let fork = b.gateway("fork", GatewayType::Parallel);
    let slow = b.user_task("slow");
    let fast = b.automatic_task("fast");
    let kill = b.add_node(
        "kill",
        FlowNodeKind::EndEvent {
            result: EndEventResult::Terminate,
        },
    );
    let slow_end = b.end_event("slow end");
    for node in [inner_start, fork, slow, fast, kill, slow_end] {
        b.in_container(node, work);
    }
    b.transition(start, work);
    b.transition(work, after);
    b.transition(after, end);
    b.transition(inner_start, fork);
    b.transition(fork, slow);
    b.transition(fork, fast);
    b.transition(fast, kill);
    b.transition(slow, slow_end);

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    one_live(&engine, pid, "after").await;
    assert!(live_named(&engine, pid, "slow").await.is_empty());
    assert!(live_named(&engine, pid, "work").await.is_empty());
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let slow = archived.iter().find(|a| a.source.name == "slow").unwrap();
    assert_eq!(slow.source.state, FlowNodeState::Aborted);
    let work = archived.iter().find(|a| a.source.name == "work").unwrap();
    assert_eq!(work.source.state, FlowNodeState::Completed);
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);

    let log = events(&engine, pid).await;
    assert!(log
        .iter()
        .any(|e| matches!(e, EngineEvent::ScopeTokensCleared { count, .. } if *count > 0)));
    assert_eq!(logged_token_balance(&log), 1);
}

// ─── Cancellation ─────────────────────────────────────────────

#[tokio::test]
async fn test_cancel_reaches_every_live_descendant() {
    let mut b = ProcessDefinitionBuilder::new("cancel", "1");
    let start = b.start_event("start");
    let fork = b.gateway("fork", GatewayType::Parallel);
    let review = b.user_task("review");
    let nested = b.sub_process("nested");
    let join = b.gateway("join", GatewayType::Parallel);
    let end = b.end_event("end");
    let inner_start = b.start_event("nested start");
    let inner = b.user_task("inner");
    let inner_end = b.end_event("nested end");
    for node in [inner_start, inner, inner_end] {
        b.in_container(node, nested);
    }
    let timeout = b.boundary_event(review, "timeout", EventTrigger::Timer { duration_ms: 60_000 }, true);
    let late = b.end_event("late");
    b.transition(start, fork);
    b.transition(fork, review);
    b.transition(fork, nested);
    b.transition(review, join);
    b.transition(nested, join);
    b.transition(join, end);
    b.transition(inner_start, inner);
    b.transition(inner, inner_end);
    b.transition(timeout, late);

    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let inner_task = one_live(&engine, pid, "inner").await;
    assert_eq!(scheduler.pending_jobs().await.len(), 1);

    engine.cancel_process_instance(pid).await.unwrap();

    assert!(engine.process_instance(pid).await.unwrap().is_none());
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Cancelled);
    assert!(engine.live_flow_nodes(pid).await.unwrap().is_empty());
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 0);
    assert!(scheduler.pending_jobs().await.is_empty());
    assert!(engine.search_waiting_events(&QueryOptions::default()).await.unwrap().is_empty());

    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    for name in ["review", "nested", "inner", "timeout"] {
        let snapshot = archived.iter().find(|a| a.source.name == name).unwrap();
        assert_eq!(snapshot.source.state, FlowNodeState::Cancelled, "{name}");
    }
    assert!(archived.iter().any(|a| a.source.id == inner_task.id));
    assert!(engine.cancel_process_instance(pid).await.unwrap_err().is_not_found());
    assert_eq!(logged_token_balance(&events(&engine, pid).await), 0);

    let deleted = engine
        .delete_parent_process_instance_and_elements(pid)
        .await
        .unwrap();
    assert!(deleted > 1);
    assert!(engine.archived_process_instance(pid).await.unwrap().is_none());
}

// ─── Incidents, retry and recovery ────────────────────────────

#[tokio::test]
async fn test_connector_failure_incident_and_retry() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let registry = ConnectorRegistry::new(1_000).register(
        "flaky",
        Arc::new(FnConnector::new(move |_| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(anyhow::anyhow!("service unavailable"))
            } else {
                Ok(DataMap::from([("receipt".to_string(), json!("r-1"))]))
            }
        })),
    );

    let mut b = ProcessDefinitionBuilder::new("charge", "1");
    let start = b.start_event("start");
    let charge = b.automatic_task("charge");
    let end = b.end_event("end");
    b.transition(start, charge);
    b.transition(charge, end);
    let mut flaky = connector("flaky", FailAction::Fail);
    flaky.outputs.insert("receipt".into(), "receipt".into());
    b.connector(charge, flaky);

    let ctx = ProcessEngineContext::in_memory(EngineConfig::default()).with_connectors(Arc::new(registry));
    let engine = ProcessEngine::new(ctx);
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.state_category, StateCategory::Error);
    let failed = one_live(&engine, pid, "charge").await;
    assert_eq!(failed.state, FlowNodeState::Failed);
    let incidents = engine.incidents(pid).await.unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].kind, IncidentKind::ConnectorFailure);
    assert!(incidents[0].is_open());
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);

    engine.retry_flow_node(failed.id).await.unwrap();

    let archived = engine.archived_process_instance(pid).await.unwrap().unwrap();
    assert_eq!(archived.source.state, ProcessState::Completed);
    assert_eq!(archived.source.state_category, StateCategory::Normal);
    assert_eq!(archived.source.data["receipt"], json!("r-1"));
    let incidents = engine.incidents(pid).await.unwrap();
    assert!(!incidents[0].is_open());
    assert_eq!(incidents[0].retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_ignored_connector_failure_keeps_going() {
    let mut b = ProcessDefinitionBuilder::new("notify", "1");
    let start = b.start_event("start");
    let notify = b.automatic_task("notify");
    let end = b.end_event("end");
    b.transition(start, notify);
    b.transition(notify, end);
    b.connector(notify, connector("mail", FailAction::Ignore));

    let ctx = ProcessEngineContext::in_memory(EngineConfig::default()).with_connectors(failing_connector("mail"));
    let engine = ProcessEngine::new(ctx);
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    assert!(events(&engine, pid).await.iter().any(|e| matches!(
        e,
        EngineEvent::ConnectorFailed { ignored: true, .. }
    )));
}

#[tokio::test]
async fn test_recovery_finishes_interrupted_drive() {
    let mut b = ProcessDefinitionBuilder::new("chain", "1");
    let start = b.start_event("start");
    let first = b.automatic_task("first");
    let second = b.automatic_task("second");
    let end = b.end_event("end");
    b.transition(start, first);
    b.transition(first, second);
    b.transition(second, end);

    let config = EngineConfig {
        max_steps_per_drive: 3,
        ..EngineConfig::default()
    };
    let ctx = ProcessEngineContext::in_memory(config);
    let engine = ProcessEngine::new(ctx.clone());
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    assert!(engine.start_process(def_id, None, DataMap::new()).await.is_err());

    let processes = engine
        .search_process_instances(&QueryOptions::default())
        .await
        .unwrap();
    assert_eq!(processes.len(), 1);
    let pid = processes[0].id;

    let restarted = ProcessEngine::new(ProcessEngineContext {
        config: Arc::new(EngineConfig::default()),
        ..ctx
    });
    assert_eq!(restarted.recover_all().await.unwrap(), 1);
    assert_eq!(archived_state(&restarted, pid).await, ProcessState::Completed);
    assert_eq!(restarted.tokens().get_number_of_tokens(pid).await.unwrap(), 0);
}

#[tokio::test]
async fn test_recovery_rearms_timers() {
    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(review_with_timeout(true)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let job = scheduler.pending_jobs().await.remove(0);

    // A scheduler restart loses its jobs.
    let fresh = Arc::new(MemoryScheduler::new());
    let restarted = ProcessEngine::new(engine.context().clone().with_scheduler(fresh.clone()));
    restarted.recover_process_instance(pid).await.unwrap();

    let jobs = fresh.pending_jobs().await;
    assert_eq!(jobs, vec![job.clone()]);
    assert!(restarted.fire_timer(&job.job_id).await.unwrap().is_delivered());
    one_live(&restarted, pid, "escalate").await;
}

#[tokio::test]
async fn test_recovery_counts_child_finished_before_interruption() {
    let ctx = ProcessEngineContext::in_memory(EngineConfig::default());
    let engine = ProcessEngine::new(ctx.clone());
    let mi = MultiInstanceLoop {
        cardinality: Some(Expression::constant(2)),
        ..MultiInstanceLoop::default()
    };
    let def_id = engine.deploy(approvals_then_after(mi, None)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let nodes = live_named(&engine, pid, "approve").await;
    let wrapper = nodes.iter().find(|n| n.is_wrapper()).unwrap().clone();
    let mut children: Vec<FlowNodeInstance> = nodes.into_iter().filter(|n| n.is_loop_child()).collect();
    children.sort_by_key(|c| c.loop_index);
    engine.execute_flow_node(children[0].id, DataMap::new()).await.unwrap();

    // The child completes and is archived, then the drive stops before the
    // wrapper hears of it.
    assert!(limited(&ctx, 1)
        .execute_flow_node(children[1].id, DataMap::new())
        .await
        .is_err());
    assert!(engine.flow_node(children[1].id).await.unwrap().is_none());
    let c = counters(&engine.flow_node(wrapper.id).await.unwrap().unwrap());
    assert_eq!((c.active, c.completed), (1, 1));

    engine.recover_process_instance(pid).await.unwrap();

    one_live(&engine, pid, "after").await;
    assert!(live_named(&engine, pid, "approve").await.is_empty());
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let snapshot = archived.iter().find(|a| a.source.id == wrapper.id).unwrap();
    assert_eq!(snapshot.source.state, FlowNodeState::Completed);
    let c = counters(&snapshot.source);
    assert_eq!((c.total, c.active, c.completed, c.terminated), (2, 0, 2, 0));
}

#[tokio::test]
async fn test_recovery_resumes_standard_loop_after_unreported_iteration() {
    let mut b = ProcessDefinitionBuilder::new("review-loop", "1");
    let start = b.start_event("start");
    let review = b.user_task("review");
    let end = b.end_event("end");
    b.transition(start, review);
    b.transition(review, end);
    b.loop_characteristics(
        review,
        LoopCharacteristics::Standard(StandardLoop {
            condition: Expression::compare(Expression::data("loopCounter"), CompareOp::Lt, Expression::constant(2)),
            test_before: false,
            loop_max: None,
        }),
    );

    let ctx = ProcessEngineContext::in_memory(EngineConfig::default());
    let engine = ProcessEngine::new(ctx.clone());
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();

    let first = live_named(&engine, pid, "review")
        .await
        .into_iter()
        .find(|n| n.is_loop_child())
        .unwrap();
    assert!(limited(&ctx, 1)
        .execute_flow_node(first.id, DataMap::new())
        .await
        .is_err());
    assert!(live_named(&engine, pid, "review")
        .await
        .iter()
        .all(|n| n.is_wrapper()));

    engine.recover_process_instance(pid).await.unwrap();

    let second = live_named(&engine, pid, "review")
        .await
        .into_iter()
        .find(|n| n.is_loop_child())
        .unwrap();
    assert_eq!(second.loop_index, Some(1));
    engine.execute_flow_node(second.id, DataMap::new()).await.unwrap();
    assert_eq!(archived_state(&engine, pid).await, ProcessState::Completed);
    assert_eq!(spawned_count(&events(&engine, pid).await), 2);
}

#[tokio::test]
async fn test_recovery_completes_triggered_catch_event() {
    let ctx = ProcessEngineContext::in_memory(EngineConfig::default());
    let engine = ProcessEngine::new(ctx.clone());
    let def_id = engine.deploy(payment_process()).await.unwrap();
    let pid = engine
        .start_process(def_id, None, data(&[("orderId", json!(5))]))
        .await
        .unwrap();

    let message = MessageInstance::new("payment")
        .correlate("orderId", 5)
        .with_payload("amount", 12);
    assert!(limited(&ctx, 0).send_message(message.clone()).await.is_err());

    // Subscription and payload committed together; the node still executes.
    let wait = one_live(&engine, pid, "wait for payment").await;
    assert_eq!(wait.state, FlowNodeState::Executing);
    assert!(engine.search_waiting_events(&QueryOptions::default()).await.unwrap().is_empty());
    let process = engine.process_instance(pid).await.unwrap().unwrap();
    assert_eq!(process.data["paid"], json!(12));

    engine.recover_process_instance(pid).await.unwrap();

    one_live(&engine, pid, "ship").await;
    assert!(live_named(&engine, pid, "wait for payment").await.is_empty());
    assert_eq!(engine.send_message(message).await.unwrap(), CorrelationOutcome::NotDelivered);
}

#[tokio::test]
async fn test_recovery_finishes_interrupted_boundary_abort() {
    let (engine, scheduler) = timer_engine();
    let def_id = engine.deploy(review_with_timeout(true)).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let job = scheduler.pending_jobs().await.remove(0);
    let waiting = engine
        .search_waiting_events(&QueryOptions::default())
        .await
        .unwrap()
        .remove(0);

    // State left by a crash right after the boundary took over the token.
    let mut review = one_live(&engine, pid, "review").await;
    let mut timeout = one_live(&engine, pid, "timeout").await;
    timeout.token_ref_id = Some(review.container_id);
    timeout.token_count = review.token_count;
    review.token_count = 0;
    review.state_category = StateCategory::Aborting;
    let mut unit = WorkUnit::new();
    unit.consume_waiting_event(waiting.id);
    unit.update_flow_node(timeout);
    unit.update_flow_node(review.clone());
    engine.context().store.commit(unit).await.unwrap();

    engine.recover_process_instance(pid).await.unwrap();

    assert!(live_named(&engine, pid, "review").await.is_empty());
    one_live(&engine, pid, "escalate").await;
    assert_eq!(engine.tokens().get_number_of_tokens(pid).await.unwrap(), 1);
    let archived = engine.archived_flow_node_instances(pid).await.unwrap();
    let snapshot = archived.iter().find(|a| a.source.id == review.id).unwrap();
    assert_eq!(snapshot.source.state, FlowNodeState::Aborted);
    assert_eq!(engine.fire_timer(&job.job_id).await.unwrap(), CorrelationOutcome::NotDelivered);
}

#[tokio::test]
async fn test_execute_flow_node_splits_local_and_process_data() {
    let mut b = ProcessDefinitionBuilder::new("split-data", "1");
    let start = b.start_event("start");
    let review = b.user_task("review");
    let end = b.end_event("end");
    b.transition(start, review);
    b.transition(review, end);
    b.loop_characteristics(
        review,
        LoopCharacteristics::MultiInstance(MultiInstanceLoop {
            cardinality: Some(Expression::constant(1)),
            output_item: Some("verdict".into()),
            output_collection: Some("verdicts".into()),
            ..MultiInstanceLoop::default()
        }),
    );

    let engine = ProcessEngine::in_memory();
    let def_id = engine.deploy(b.build().unwrap()).await.unwrap();
    let pid = engine.start_process(def_id, None, DataMap::new()).await.unwrap();
    let child = live_named(&engine, pid, "review")
        .await
        .into_iter()
        .find(|n| n.is_loop_child())
        .unwrap();

    engine
        .execute_flow_node(
            child.id,
            data(&[("verdict", json!("ok")), ("reviewer", json!("sam"))]),
        )
        .await
        .unwrap();

    let archived = engine.archived_process_instance(pid).await.unwrap().unwrap();
    assert_eq!(archived.source.data["verdicts"], json!(["ok"]));
    assert_eq!(archived.source.data["reviewer"], json!("sam"));
    assert!(!archived.source.data.contains_key("verdict"));
}
