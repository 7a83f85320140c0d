// tests/supervisor.rs

use std::error::Error;
use std::path::Path;
use std::sync::{Arc, Barrier};
use std::time::Duration;

use stepflow::engine::{Engine, SubmitError};
use stepflow::exec::SYSTEM_EXIT_CODE;
use stepflow::store::{StateStore, TaskState};
use stepflow::types::{ListOrder, State};
use stepflow_test_utils::builders::{StepBuilder, TaskBuilder};
use stepflow_test_utils::fake_runner::{FakeBackend, FakeBehaviour, FakeEvent};
use stepflow_test_utils::{init_tracing, test_engine_config, with_timeout};

type TestResult = Result<(), Box<dyn Error>>;

const POLL: Duration = Duration::from_millis(10);

fn fake_engine(root: &Path, fake: &FakeBackend) -> Engine {
    Engine::with_backends(test_engine_config(root), StateStore::in_memory(), fake.registry())
}

async fn finished(engine: &Engine, id: &str) -> TaskState {
    with_timeout(engine.wait_for(id, POLL))
        .await
        .unwrap_or_else(|| panic!("task {id} record vanished"))
}

/// Wait until the fake backend has started `step`.
async fn started(fake: &FakeBackend, step: &str) {
    with_timeout(async {
        while !fake.started().iter().any(|s| s == step) {
            tokio::time::sleep(POLL).await;
        }
    })
    .await
}

#[tokio::test]
async fn diamond_task_completes_in_dependency_order() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("b", FakeBehaviour::Sleep(Duration::from_millis(50)));
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("diamond")
        .with_step(StepBuilder::fake("a"))
        .with_step(StepBuilder::fake("b").after(&["a"]))
        .with_step(StepBuilder::fake("c").after(&["a"]))
        .with_step(StepBuilder::fake("d").after(&["b", "c"]))
        .build();

    let id = engine.submit(spec)?;
    assert_eq!(id, "diamond");

    let task = finished(&engine, &id).await;
    assert_eq!(task.state, State::Stop);
    assert!(task.message.is_empty());
    assert_eq!(task.count, 4);
    assert!(task.times.end.is_some());

    let steps = engine.steps(&id);
    assert_eq!(steps.len(), 4);
    assert!(steps.iter().all(|s| s.state == State::Stop && s.code == 0));
    assert_eq!(steps[3].depends_on, vec!["b", "c"]);

    let start_d = fake.position(&FakeEvent::Started("d".into())).unwrap();
    assert!(fake.position(&FakeEvent::Finished("b".into())).unwrap() < start_d);
    assert!(fake.position(&FakeEvent::Finished("c".into())).unwrap() < start_d);
    assert_eq!(fake.started().len(), 4);
    Ok(())
}

#[tokio::test]
async fn cycle_marks_task_and_steps_as_system_error() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("cyclic")
        .with_step(StepBuilder::fake("root"))
        .with_step(StepBuilder::fake("a").after(&["b"]))
        .with_step(StepBuilder::fake("b").after(&["a"]))
        .build();

    let id = engine.submit(spec)?;
    let task = finished(&engine, &id).await;

    assert_eq!(task.state, State::SystemError);
    assert!(task.message.contains("cycle"), "{}", task.message);
    assert!(fake.started().is_empty());
    for step in engine.steps(&id) {
        assert_eq!(step.state, State::SystemError);
        assert_eq!(step.code, SYSTEM_EXIT_CODE);
    }
    Ok(())
}

#[tokio::test]
async fn failed_step_blocks_dependents_only() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("a", FakeBehaviour::Fail(2));
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("partial")
        .with_step(StepBuilder::fake("a"))
        .with_step(StepBuilder::fake("after-a").after(&["a"]))
        .with_step(StepBuilder::fake("independent"))
        .build();

    let id = engine.submit(spec)?;
    let task = finished(&engine, &id).await;

    assert_eq!(task.state, State::Stop);
    assert!(task.message.contains("exit status 2"), "{}", task.message);

    let a = engine.step(&id, 0).expect("step a");
    assert_eq!((a.state, a.code), (State::Stop, 2));

    let blocked = engine.step(&id, 1).expect("step after-a");
    assert_eq!(blocked.state, State::Stop);
    assert_eq!(blocked.code, SYSTEM_EXIT_CODE);
    assert!(blocked.message.starts_with("not started"), "{}", blocked.message);

    let independent = engine.step(&id, 2).expect("independent step");
    assert_eq!((independent.state, independent.code), (State::Stop, 0));

    assert!(!fake.started().contains(&"after-a".to_string()));
    Ok(())
}

#[tokio::test]
async fn duplicate_step_names_are_rejected_at_submit() -> TestResult {
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("dupes")
        .with_step(StepBuilder::fake("a"))
        .with_step(StepBuilder::fake("b"))
        .with_step(StepBuilder::fake("a"))
        .build();

    let err = engine.submit(spec).unwrap_err();
    assert_eq!(err, SubmitError::DuplicateStepName(vec![("a".to_string(), 2)]));
    assert!(err.to_string().contains("a repeat count 2"));
    assert!(engine.task("dupes").is_none());
    Ok(())
}

#[tokio::test]
async fn empty_task_is_rejected() -> TestResult {
    let dir = tempfile::tempdir()?;
    let engine = fake_engine(dir.path(), &FakeBackend::new());

    let err = engine.submit(TaskBuilder::new("empty").build()).unwrap_err();
    assert_eq!(err, SubmitError::EmptyTask);
    Ok(())
}

#[tokio::test]
async fn resubmitting_an_active_task_is_rejected() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("h", FakeBehaviour::Hang);
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("once").with_step(StepBuilder::fake("h")).build();
    engine.submit(spec.clone())?;

    let err = engine.submit(spec.clone()).unwrap_err();
    assert_eq!(err, SubmitError::TaskAlreadyRunning("once".to_string()));

    started(&fake, "h").await;
    engine.stop_step("once", 0)?;
    finished(&engine, "once").await;

    // A finished task may be submitted again under the same id.
    engine.submit(spec)?;
    with_timeout(async {
        while engine.step("once", 0).map(|s| s.state) != Some(State::Running) {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;
    engine.stop_step("once", 0)?;
    assert_eq!(finished(&engine, "once").await.state, State::Stop);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_submits_of_one_id_admit_exactly_one() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("h", FakeBehaviour::Hang);
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("contended").with_step(StepBuilder::fake("h")).build();
    let barrier = Arc::new(Barrier::new(8));
    let submits: Vec<_> = (0..8)
        .map(|_| {
            let engine = engine.clone();
            let spec = spec.clone();
            let barrier = Arc::clone(&barrier);
            tokio::task::spawn_blocking(move || {
                barrier.wait();
                engine.submit(spec)
            })
        })
        .collect();

    let mut accepted = 0;
    for submit in submits {
        match with_timeout(submit).await? {
            Ok(_) => accepted += 1,
            Err(err) => assert_eq!(err, SubmitError::TaskAlreadyRunning("contended".to_string())),
        }
    }
    assert_eq!(accepted, 1);

    started(&fake, "h").await;
    engine.stop_step("contended", 0)?;
    assert_eq!(finished(&engine, "contended").await.state, State::Stop);
    assert_eq!(fake.started().len(), 1);
    Ok(())
}

#[tokio::test]
async fn resubmission_starts_from_clean_records() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let lines: Vec<String> = (1..=3).map(|i| format!("line {i}")).collect();
    fake.set("talk", FakeBehaviour::Output(lines));
    let engine = fake_engine(dir.path(), &fake);

    let first = TaskBuilder::new("re")
        .with_step(StepBuilder::fake("talk"))
        .with_step(StepBuilder::fake("extra"))
        .build();
    engine.submit(first)?;
    finished(&engine, "re").await;
    assert_eq!(engine.output_done("re", 0), Some(3));
    assert_eq!(engine.steps("re").len(), 2);

    fake.set("talk", FakeBehaviour::Hang);
    let second = TaskBuilder::new("re").with_step(StepBuilder::fake("talk")).build();
    engine.submit(second)?;
    with_timeout(async {
        while engine.step("re", 0).map(|s| s.state) != Some(State::Running) {
            tokio::time::sleep(POLL).await;
        }
    })
    .await;

    // Nothing from the first run is visible while the new step is running.
    assert_eq!(engine.output_done("re", 0), None);
    assert!(engine.outputs("re", 0).is_empty());
    assert_eq!(engine.steps("re").len(), 1);

    engine.stop_step("re", 0)?;
    finished(&engine, "re").await;
    Ok(())
}

#[tokio::test]
async fn task_ids_must_be_a_single_path_component() -> TestResult {
    init_tracing();
    let root = tempfile::tempdir()?;
    let outside = tempfile::tempdir()?;
    let precious = outside.path().join("precious.txt");
    std::fs::write(&precious, "keep me")?;

    let fake = FakeBackend::new();
    let engine = fake_engine(root.path(), &fake);

    let outside_id = outside.path().to_string_lossy().into_owned();
    let ids = [
        outside_id.as_str(),
        "..",
        ".",
        "../../escape",
        "nested/dir",
        r"back\slash",
        "a:b",
    ];
    for id in ids {
        let spec = TaskBuilder::new(id).with_step(StepBuilder::fake("a")).build();
        let err = engine.submit(spec).unwrap_err();
        assert_eq!(err, SubmitError::InvalidTaskId(id.to_string()), "id {id:?}");
    }

    assert!(precious.exists());
    assert!(fake.started().is_empty());
    assert!(engine.list_tasks(ListOrder::StartTime).is_empty());

    // Dots inside a plain name are fine.
    let id = engine.submit(
        TaskBuilder::new("release-1.2_rc")
            .with_step(StepBuilder::fake("a"))
            .build(),
    )?;
    assert_eq!(finished(&engine, &id).await.state, State::Stop);
    Ok(())
}

#[tokio::test]
async fn anonymous_task_gets_generated_names_and_metadata() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::anonymous()
        .metadata("owner", "ci")
        .with_step(StepBuilder::unnamed("fake:", "").env("HARDWARE_ID", "hw-1"))
        .with_step(StepBuilder::unnamed("fake:", "").env("VM_INSTANCE_ID", "vm-9"))
        .sequential()
        .build();

    let id = engine.submit(spec)?;
    assert_eq!(id.len(), 32);
    assert!(id.chars().all(|c| c.is_ascii_hexdigit()));

    let task = finished(&engine, &id).await;
    assert_eq!(task.metadata.get("hardware_id").map(String::as_str), Some("hw-1"));
    assert_eq!(task.metadata.get("vm_instance_id").map(String::as_str), Some("vm-9"));
    assert_eq!(task.metadata.get("owner").map(String::as_str), Some("ci"));

    let steps = engine.steps(&id);
    assert_eq!(steps[0].name, format!("{id}-0"));
    assert_eq!(steps[1].name, format!("{id}-1"));
    assert_eq!(steps[1].depends_on, vec![format!("{id}-0")]);
    Ok(())
}

#[tokio::test]
async fn stopping_a_step_kills_only_that_step() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("hang", FakeBehaviour::Hang);
    fake.set("slow", FakeBehaviour::Sleep(Duration::from_millis(100)));
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("stop-one")
        .with_step(StepBuilder::fake("hang"))
        .with_step(StepBuilder::fake("slow"))
        .build();

    let id = engine.submit(spec)?;
    started(&fake, "hang").await;
    assert_eq!(engine.step(&id, 0).map(|s| s.state), Some(State::Running));

    engine.stop_step(&id, 0)?;
    let task = finished(&engine, &id).await;
    assert_eq!(task.state, State::Stop);

    let hang = engine.step(&id, 0).expect("hang step");
    assert_eq!(hang.code, SYSTEM_EXIT_CODE);
    assert_eq!(hang.message, "manually stopped");

    let slow = engine.step(&id, 1).expect("slow step");
    assert_eq!(slow.code, 0);

    assert!(engine.stop_step(&id, 0).is_err(), "step no longer registered");
    Ok(())
}

#[tokio::test]
async fn stopping_a_task_lets_running_steps_finish_but_starts_nothing_new() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("first", FakeBehaviour::Sleep(Duration::from_millis(150)));
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("stop-task")
        .with_step(StepBuilder::fake("first"))
        .with_step(StepBuilder::fake("second"))
        .sequential()
        .build();

    let id = engine.submit(spec)?;
    started(&fake, "first").await;
    assert!(engine.is_active(&id));

    engine.stop_task(&id)?;
    let task = finished(&engine, &id).await;

    assert_eq!(task.state, State::Stop);
    assert_eq!(engine.step(&id, 0).map(|s| s.code), Some(0));

    let second = engine.step(&id, 1).expect("second step");
    assert_eq!(second.state, State::Stop);
    assert_eq!(second.code, SYSTEM_EXIT_CODE);
    assert_eq!(second.message, "not started: task was stopped");
    assert!(!fake.started().contains(&"second".to_string()));
    assert!(!engine.is_active(&id));
    Ok(())
}

#[tokio::test]
async fn task_timeout_stops_scheduling() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("slow", FakeBehaviour::Sleep(Duration::from_millis(300)));
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("deadline")
        .timeout(Duration::from_millis(100))
        .with_step(StepBuilder::fake("slow"))
        .with_step(StepBuilder::fake("late").after(&["slow"]))
        .build();

    let id = engine.submit(spec)?;
    let task = finished(&engine, &id).await;

    assert_eq!(task.state, State::Stop);
    assert!(task.message.contains("cancelled"), "{}", task.message);
    assert_eq!(engine.step(&id, 0).map(|s| s.code), Some(0));
    assert_eq!(engine.step(&id, 1).map(|s| s.code), Some(SYSTEM_EXIT_CODE));
    assert_eq!(fake.started(), vec!["slow"]);
    Ok(())
}

#[tokio::test]
async fn panicking_step_is_recorded_as_system_failure() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("boom", FakeBehaviour::Panic);
    let engine = fake_engine(dir.path(), &fake);

    let spec = TaskBuilder::new("panics")
        .with_step(StepBuilder::fake("boom"))
        .with_step(StepBuilder::fake("fine"))
        .build();

    let id = engine.submit(spec)?;
    finished(&engine, &id).await;

    let boom = engine.step(&id, 0).expect("boom step");
    assert_eq!(boom.code, SYSTEM_EXIT_CODE);
    assert!(boom.message.contains("fake step 'boom' panicked"), "{}", boom.message);
    assert_eq!(engine.step(&id, 1).map(|s| s.code), Some(0));
    Ok(())
}

#[tokio::test]
async fn outputs_are_readable_through_the_engine() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let lines: Vec<String> = (1..=4).map(|i| format!("line {i}")).collect();
    fake.set("talk", FakeBehaviour::Output(lines));
    let engine = fake_engine(dir.path(), &fake);

    let id = engine.submit(TaskBuilder::new("talky").with_step(StepBuilder::fake("talk")).build())?;
    finished(&engine, &id).await;

    assert_eq!(engine.output_done(&id, 0), Some(4));
    assert_eq!(engine.outputs(&id, 0).len(), 4);
    let tail: Vec<String> = engine
        .outputs_from(&id, 0, 3)
        .into_iter()
        .map(|o| o.content)
        .collect();
    assert_eq!(tail, vec!["line 3", "line 4"]);
    Ok(())
}

#[tokio::test]
async fn pool_stats_track_queued_and_running_tasks() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("blocker", FakeBehaviour::Hang);
    let mut config = test_engine_config(dir.path());
    config.pool_size = 1;
    let engine = Engine::with_backends(config, StateStore::in_memory(), fake.registry());

    engine.submit(TaskBuilder::new("t0").with_step(StepBuilder::fake("blocker")).build())?;
    engine.submit(TaskBuilder::new("t1").with_step(StepBuilder::fake("x")).build())?;
    engine.submit(TaskBuilder::new("t2").with_step(StepBuilder::fake("y")).build())?;

    started(&fake, "blocker").await;
    let stats = engine.stats();
    assert_eq!((stats.running, stats.waiting, stats.capacity), (1, 2, 1));
    assert_eq!(engine.task("t1").map(|t| t.state), Some(State::Pending));

    engine.resize_pool(3);
    finished(&engine, "t1").await;
    finished(&engine, "t2").await;
    assert_eq!(engine.stats().capacity, 3);

    engine.stop_step("t0", 0)?;
    finished(&engine, "t0").await;
    assert_eq!(engine.list_tasks(ListOrder::StartTime).len(), 3);
    Ok(())
}

#[tokio::test]
async fn submit_after_shutdown_is_refused() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    let engine = fake_engine(dir.path(), &fake);

    let id = engine.submit(TaskBuilder::new("last").with_step(StepBuilder::fake("a")).build())?;
    with_timeout(engine.shutdown()).await?;

    // Shutdown waited for the queued task.
    assert_eq!(engine.task(&id).map(|t| t.state), Some(State::Stop));

    let err = engine
        .submit(TaskBuilder::new("late").with_step(StepBuilder::fake("a")).build())
        .unwrap_err();
    assert_eq!(err, SubmitError::Closed);
    Ok(())
}

#[tokio::test]
async fn shutdown_now_kills_running_steps() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let fake = FakeBackend::new();
    fake.set("forever", FakeBehaviour::Hang);
    let engine = fake_engine(dir.path(), &fake);

    let id = engine.submit(
        TaskBuilder::new("doomed")
            .with_step(StepBuilder::fake("forever"))
            .with_step(StepBuilder::fake("never").after(&["forever"]))
            .build(),
    )?;
    started(&fake, "forever").await;

    with_timeout(engine.shutdown_now()).await?;

    let task = engine.task(&id).expect("task record");
    assert_eq!(task.state, State::Stop);
    assert_eq!(engine.step(&id, 0).map(|s| s.code), Some(SYSTEM_EXIT_CODE));
    assert_eq!(engine.step(&id, 1).map(|s| s.state), Some(State::Stop));
    Ok(())
}

#[cfg(unix)]
#[tokio::test]
async fn shell_steps_share_a_workspace_that_is_removed_afterwards() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let engine = Engine::new(test_engine_config(dir.path()), StateStore::in_memory());

    let spec = TaskBuilder::new("shell")
        .with_step(StepBuilder::sh("write", "echo hello > note.txt\n"))
        .with_step(StepBuilder::sh("read", "cat note.txt\necho \"step $TASK_STEP_ID\"\n"))
        .sequential()
        .build();

    let id = engine.submit(spec)?;
    let task = finished(&engine, &id).await;
    assert_eq!(task.state, State::Stop);
    assert!(engine.steps(&id).iter().all(|s| s.code == 0));

    let lines: Vec<String> = engine.outputs(&id, 1).into_iter().map(|o| o.content).collect();
    assert_eq!(lines, vec!["hello", "step 1"]);

    assert!(!dir.path().join("workspace").join(&id).exists());
    assert!(!dir.path().join("scripts").join(&id).exists());
    Ok(())
}
