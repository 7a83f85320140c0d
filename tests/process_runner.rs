// tests/process_runner.rs
#![cfg(unix)]

use std::collections::BTreeMap;
use std::error::Error;
use std::path::Path;
use std::time::{Duration, Instant};

use stepflow::exec::{ProcessRunner, StepContext, StepError, StepRunner, SYSTEM_EXIT_CODE};
use stepflow::store::StateStore;
use stepflow_test_utils::{init_tracing, with_timeout};
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

fn context(root: &Path, task_id: &str, kind: &str, content: &str) -> StepContext {
    let workspace = root.join("workspace");
    std::fs::create_dir_all(&workspace).expect("create workspace");
    StepContext {
        task_id: task_id.to_string(),
        index: 0,
        name: "step".to_string(),
        kind: kind.to_string(),
        content: content.to_string(),
        env: BTreeMap::new(),
        timeout: Duration::from_secs(10),
        key_ttl: Duration::from_secs(60),
        workspace,
        script_dir: root.join("scripts"),
    }
}

fn contents(store: &StateStore, task_id: &str) -> Vec<String> {
    store
        .outputs(task_id, 0)
        .into_iter()
        .map(|o| o.content)
        .collect()
}

#[tokio::test]
async fn output_lines_are_numbered_without_gaps() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(dir.path(), "t-lines", "sh", "for i in 1 2 3 4 5; do echo \"line $i\"; done\n");

    let mut runner = ProcessRunner::new(ctx, store.clone());
    with_timeout(runner.run(CancellationToken::new())).await?;
    runner.cleanup()?;

    let outputs = store.outputs("t-lines", 0);
    let numbers: Vec<u64> = outputs.iter().map(|o| o.line).collect();
    assert_eq!(numbers, vec![1, 2, 3, 4, 5]);
    assert_eq!(outputs[4].content, "line 5");
    assert_eq!(store.output_done("t-lines", 0), Some(5));
    Ok(())
}

#[tokio::test]
async fn stderr_is_merged_and_blank_lines_skipped() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(
        dir.path(),
        "t-merge",
        "sh",
        "echo out\necho\necho '   '\necho err 1>&2\n",
    );

    let mut runner = ProcessRunner::new(ctx, store.clone());
    with_timeout(runner.run(CancellationToken::new())).await?;

    let mut lines = contents(&store, "t-merge");
    lines.sort();
    assert_eq!(lines, vec!["err", "out"]);
    assert_eq!(store.output_done("t-merge", 0), Some(2));
    Ok(())
}

#[tokio::test]
async fn non_zero_exit_reports_program_code() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(dir.path(), "t-exit", "sh", "echo failing\nexit 3\n");

    let mut runner = ProcessRunner::new(ctx, store.clone());
    let err = with_timeout(runner.run(CancellationToken::new()))
        .await
        .unwrap_err();

    assert!(matches!(err, StepError::NonZeroExit(3)), "got {err:?}");
    assert_eq!(err.exit_code(), 3);
    assert_eq!(contents(&store, "t-exit"), vec!["failing"]);
    Ok(())
}

#[tokio::test]
async fn timeout_kills_the_whole_process_group() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let mut ctx = context(
        dir.path(),
        "t-timeout",
        "sh",
        "echo started\nsleep 30 &\nsleep 30\n",
    );
    ctx.timeout = Duration::from_millis(300);

    let mut runner = ProcessRunner::new(ctx, store.clone());
    let started = Instant::now();
    let err = with_timeout(runner.run(CancellationToken::new()))
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, StepError::Timeout(_)), "got {err:?}");
    assert_eq!(err.exit_code(), SYSTEM_EXIT_CODE);
    // The background sleep holds stdout open; capture only finishes this
    // quickly if it was killed along with the shell.
    assert!(elapsed < Duration::from_secs(4), "took {elapsed:?}");
    assert_eq!(contents(&store, "t-timeout"), vec!["started"]);
    assert_eq!(store.output_done("t-timeout", 0), Some(1));
    Ok(())
}

#[tokio::test]
async fn cancellation_is_a_manual_stop() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(dir.path(), "t-stop", "sh", "sleep 30\n");

    let mut runner = ProcessRunner::new(ctx, store);
    let cancel = CancellationToken::new();
    let stopper = {
        let cancel = cancel.clone();
        async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            cancel.cancel();
        }
    };

    let (result, ()) = with_timeout(async { tokio::join!(runner.run(cancel), stopper) }).await;

    let err = result.unwrap_err();
    assert!(matches!(err, StepError::ManualStop), "got {err:?}");
    assert_eq!(err.exit_code(), SYSTEM_EXIT_CODE);
    Ok(())
}

#[tokio::test]
async fn unknown_command_type_is_rejected_before_staging() -> TestResult {
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(dir.path(), "t-cobol", "cobol", "DISPLAY 'HI'.");

    let mut runner = ProcessRunner::new(ctx, store.clone());
    let err = runner.run(CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, StepError::UnsupportedShell(ref kind) if kind == "cobol"));
    assert!(runner.script_path().is_none());
    assert_eq!(store.output_done("t-cobol", 0), None);
    Ok(())
}

#[tokio::test]
async fn script_is_removed_on_cleanup() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let mut ctx = context(dir.path(), "t-script", "sh", "true\n");
    ctx.name = "build app".to_string();

    let mut runner = ProcessRunner::new(ctx, store);
    with_timeout(runner.run(CancellationToken::new())).await?;

    let script = runner.script_path().expect("script staged").to_path_buf();
    assert!(script.is_file());
    assert_eq!(script.file_name().and_then(|n| n.to_str()), Some("build_app.sh"));

    runner.cleanup()?;
    assert!(!script.exists());
    assert!(runner.script_path().is_none());
    Ok(())
}

#[tokio::test]
async fn step_environment_is_injected() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let mut ctx = context(
        dir.path(),
        "t-env",
        "sh",
        "echo \"$TASK_ID $TASK_STEP_ID $TASK_STEP_NAME $GREETING\"\n",
    );
    ctx.index = 3;
    ctx.name = "greet".to_string();
    ctx.env.insert("GREETING".to_string(), "hello".to_string());

    let mut runner = ProcessRunner::new(ctx, store.clone());
    with_timeout(runner.run(CancellationToken::new())).await?;

    let lines: Vec<String> = store.outputs("t-env", 3).into_iter().map(|o| o.content).collect();
    assert_eq!(lines, vec!["t-env 3 greet hello"]);
    Ok(())
}

#[tokio::test]
async fn process_runs_in_the_workspace() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    let ctx = context(dir.path(), "t-cwd", "sh", "pwd -P\n");
    let workspace = ctx.workspace.canonicalize()?;

    let mut runner = ProcessRunner::new(ctx, store.clone());
    with_timeout(runner.run(CancellationToken::new())).await?;

    assert_eq!(
        contents(&store, "t-cwd"),
        vec![workspace.to_string_lossy().into_owned()]
    );
    Ok(())
}

#[tokio::test]
async fn gbk_output_is_decoded() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let store = StateStore::in_memory();
    // "你好" in GBK.
    let ctx = context(dir.path(), "t-gbk", "sh", "printf '\\304\\343\\272\\303\\n'\n");

    let mut runner = ProcessRunner::new(ctx, store.clone());
    with_timeout(runner.run(CancellationToken::new())).await?;

    assert_eq!(contents(&store, "t-gbk"), vec!["你好"]);
    Ok(())
}
