use std::time::Duration;

use futures::StreamExt;
use ironposh_pool_core::{
    ErrorItem, PipelineCommand, PipelineSpec, PipelineStateInfo, PoolError, PsInvocationState,
    PsItem, PsValue, RunspaceState, RunspaceStateInfo,
};
use tokio_util::sync::CancellationToken;
use tracing_test::traced_test;

use super::mock_pool;
use crate::{
    ErrorPolicy, InvocationContext, Pipeline, PipelineData, Runspace, run_pipeline,
    testing::ScriptStep,
};

fn get_vhd() -> Pipeline {
    Pipeline::new(
        PipelineSpec::new()
            .with_command(PipelineCommand::new_command("Get-VHD").with_named("Path", "D:\\vm"))
            .with_command(PipelineCommand::new_command("Select-Object").with_positional("Size")),
    )
}

async fn collect(
    stream: crate::PsItemStream,
) -> (Vec<PsItem>, Option<PoolError>) {
    let mut items = Vec::new();
    let mut stream = stream;
    while let Some(item) = stream.next().await {
        match item {
            Ok(item) => items.push(item),
            Err(e) => {
                assert!(stream.next().await.is_none(), "stream continued after error");
                return (items, Some(e));
            }
        }
    }
    (items, None)
}

#[tokio::test]
#[traced_test]
async fn test_opens_runspace_and_streams_results() {
    let (pool, factory) = mock_pool(
        1,
        vec![
            ScriptStep::output(1),
            ScriptStep::output(2),
            ScriptStep::completed(),
        ],
    );
    let lease = pool.lease(&InvocationContext::default()).await.unwrap();

    let stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &InvocationContext::default());
    let (items, error) = collect(stream).await;

    assert!(error.is_none());
    assert_eq!(
        items,
        vec![PsItem::Value(PsValue::Int(1)), PsItem::Value(PsValue::Int(2))]
    );

    let runspace = &factory.created()[0];
    assert_eq!(runspace.opens(), 1);
    assert_eq!(runspace.pipelines(), 1);
    assert_eq!(runspace.state().state, RunspaceState::Opened);
    // released with an eager reset before the stream ended
    assert_eq!(runspace.resets(), 1);

    let status = pool.status();
    assert_eq!(status.rented, 0);
    assert_eq!(status.idle, 1);
    assert!(logs_contain("executing pipeline"));
}

#[tokio::test]
async fn test_already_open_runspace_is_not_reopened() {
    let (pool, factory) = mock_pool(1, vec![ScriptStep::output("a"), ScriptStep::completed()]);
    let ctx = InvocationContext::default();

    for _ in 0..3 {
        let lease = pool.lease(&ctx).await.unwrap();
        let (items, error) = collect(run_pipeline(lease, "Get-Date", ErrorPolicy::PassThrough, &ctx)).await;
        assert!(error.is_none());
        assert_eq!(items.len(), 1);
    }

    let runspace = &factory.created()[0];
    assert_eq!(factory.created_count(), 1);
    assert_eq!(runspace.opens(), 1);
    assert_eq!(runspace.pipelines(), 3);
}

#[tokio::test]
async fn test_output_and_errors_keep_emission_order() {
    let (pool, _factory) = mock_pool(
        1,
        vec![
            ScriptStep::output("a"),
            ScriptStep::error("b"),
            ScriptStep::output("c"),
            ScriptStep::completed(),
        ],
    );
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();

    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
    assert!(error.is_none());

    assert_eq!(items[0], PsItem::Value(PsValue::from("a")));
    assert_eq!(items[1].as_error().map(|e| e.message.as_str()), Some("b"));
    assert_eq!(items[2], PsItem::Value(PsValue::from("c")));
}

#[tokio::test]
async fn test_errors_written_before_completion_are_not_dirty() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::error("disk is read-only"), ScriptStep::completed()]);
    let ctx = InvocationContext::default();

    for _ in 0..20 {
        let lease = pool.lease(&ctx).await.unwrap();
        let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
        assert!(error.is_none());
        assert_eq!(items.len(), 1);
        assert_eq!(
            items[0].as_error().map(|e| e.message.as_str()),
            Some("disk is read-only")
        );
    }
}

#[tokio::test]
async fn test_error_arriving_after_completion_appends_dirty_record() {
    let (pool, _factory) = mock_pool(
        1,
        vec![
            ScriptStep::output(1),
            ScriptStep::completed(),
            ScriptStep::error("disk is read-only"),
        ],
    );
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();

    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
    assert!(error.is_none());
    assert_eq!(items.len(), 3);
    assert_eq!(items[0], PsItem::Value(PsValue::Int(1)));
    assert_eq!(
        items[1].as_error().map(|e| e.message.as_str()),
        Some("disk is read-only")
    );
    assert!(items[2].as_error().is_some_and(|e| e.is_dirty_pipeline()));
    assert_eq!(pool.status().rented, 0);
}

#[tokio::test]
async fn test_late_error_fails_the_fail_on_error_policy() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::completed(), ScriptStep::error("late")]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();

    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::fail_on_error(), &ctx)).await;
    assert!(items.is_empty());
    assert!(matches!(error, Some(PoolError::Remote(record)) if record.message == "late"));
}

#[tokio::test]
async fn test_unrecognized_error_items_become_records() {
    let (pool, _factory) = mock_pool(
        1,
        vec![
            ScriptStep::Error(ErrorItem::Null),
            ScriptStep::Error(ErrorItem::Object(PsValue::Int(5))),
            ScriptStep::completed(),
        ],
    );
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();

    let (items, _) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
    let messages: Vec<_> = items
        .iter()
        .filter_map(PsItem::as_error)
        .map(|e| e.message.clone())
        .collect();
    assert_eq!(messages[0], "null error");
    assert_eq!(messages[1], "error[System.Int64] 5");
}

#[tokio::test]
async fn test_failed_pipeline_reports_cause_without_losing_values() {
    let (pool, _factory) = mock_pool(
        1,
        vec![
            ScriptStep::output(1),
            ScriptStep::output(2),
            ScriptStep::failed("The term 'Get-VHD' is not recognized"),
        ],
    );
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();

    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
    assert_eq!(
        items,
        vec![PsItem::Value(PsValue::Int(1)), PsItem::Value(PsValue::Int(2))]
    );
    match error {
        Some(PoolError::PipelineFailed(reason)) => {
            assert_eq!(reason, "The term 'Get-VHD' is not recognized");
        }
        other => panic!("expected PipelineFailed, got {other:?}"),
    }

    // a remote failure does not invalidate the runspace
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_broken_runspace_fails_stream_and_is_discarded() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::output(1)]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let mut stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx);
    assert_eq!(stream.next().await.unwrap().unwrap(), PsItem::Value(PsValue::Int(1)));

    runspace.set_state(RunspaceStateInfo::with_reason(
        RunspaceState::Broken,
        "connection reset by peer",
    ));

    match stream.next().await {
        Some(Err(PoolError::SessionBroken(reason))) => assert_eq!(reason, "connection reset by peer"),
        other => panic!("expected SessionBroken, got {other:?}"),
    }
    assert!(stream.next().await.is_none());

    assert!(runspace.is_closed());
    assert_eq!(pool.status().live, 0);
}

#[tokio::test]
async fn test_open_failure_retires_runspace() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::completed()]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    lease.fail_open("Access is denied");
    let runspace = (*lease).clone();

    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx)).await;
    assert!(items.is_empty());
    assert!(matches!(error, Some(PoolError::SessionBroken(r)) if r == "Access is denied"));
    assert!(runspace.is_closed());
    assert_eq!(runspace.pipelines(), 1);
    assert_eq!(pool.status().live, 0);
}

#[tokio::test]
async fn test_cancel_stops_pipeline_and_returns_runspace() {
    let (pool, _factory) = mock_pool(2, vec![ScriptStep::output(1)]);
    let token = CancellationToken::new();
    let ctx = InvocationContext::with_cancel(token.clone());
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let mut stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx);
    assert_eq!(stream.next().await.unwrap().unwrap(), PsItem::Value(PsValue::Int(1)));

    token.cancel();
    assert!(matches!(stream.next().await, Some(Err(PoolError::Cancelled))));
    assert!(stream.next().await.is_none());

    assert_eq!(runspace.stops(), 1);
    let status = pool.status();
    assert_eq!(status.rented, 0);
    assert_eq!(status.idle, 1);

    // every slot can still be leased
    let fresh = InvocationContext::default();
    let first = pool.lease(&fresh).await.unwrap();
    let second = pool.lease(&fresh).await.unwrap();
    assert_ne!(first.id(), second.id());
}

#[tokio::test]
async fn test_pipeline_timeout_behaves_like_cancel() {
    let (pool, _factory) = mock_pool(1, vec![]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let pipeline = Pipeline::new(
        PipelineSpec::from(PipelineCommand::new_script("Start-Sleep 60"))
            .with_timeout(Duration::from_millis(40)),
    );
    let (items, error) = collect(run_pipeline(lease, pipeline, ErrorPolicy::PassThrough, &ctx)).await;

    assert!(items.is_empty());
    assert!(matches!(error, Some(PoolError::Timeout(d)) if d == Duration::from_millis(40)));
    assert_eq!(runspace.stops(), 1);
    assert_eq!(pool.status().rented, 0);
}

#[tokio::test]
#[traced_test]
async fn test_timeout_counts_from_first_poll() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::output(1), ScriptStep::completed()]);
    let lease = pool.lease(&InvocationContext::default()).await.unwrap();
    let ctx = InvocationContext::with_timeout(Duration::from_millis(50));

    let stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx);
    tokio::time::sleep(Duration::from_millis(150)).await;
    let (items, error) = collect(stream).await;

    assert!(error.is_none(), "{error:?}");
    assert_eq!(items, vec![PsItem::Value(PsValue::Int(1))]);
    assert!(logs_contain("run_pipeline{runspace="));
}

#[tokio::test]
async fn test_dropping_stream_stops_pipeline() {
    let (pool, _factory) = mock_pool(1, vec![ScriptStep::output(1), ScriptStep::output(2)]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let mut stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx);
    assert!(stream.next().await.is_some());
    drop(stream);

    assert_eq!(runspace.stops(), 1);
    assert_eq!(pool.status().idle, 1);
}

#[tokio::test]
async fn test_completion_while_running() {
    let (pool, _factory) = mock_pool(1, vec![]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let mut stream = run_pipeline(lease, get_vhd(), ErrorPolicy::PassThrough, &ctx);
    let collector = tokio::spawn(async move {
        let mut items = Vec::new();
        while let Some(item) = stream.next().await {
            items.push(item.unwrap());
        }
        items
    });

    while runspace.pipelines() == 0 || runspace.availability() != ironposh_pool_core::RunspaceAvailability::Busy {
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    runspace.write_current(PipelineData::Output(PsValue::from("late"))).unwrap();
    runspace.finish_current(PipelineStateInfo::from(PsInvocationState::Completed));

    let items = collector.await.unwrap();
    assert_eq!(items, vec![PsItem::Value(PsValue::from("late"))]);
    assert_eq!(runspace.stops(), 0);
}

#[tokio::test]
async fn test_input_is_fed_then_closed() {
    let (pool, _factory) = mock_pool(1, vec![]);
    let ctx = InvocationContext::default();
    let lease = pool.lease(&ctx).await.unwrap();
    let runspace = (*lease).clone();

    let pipeline = get_vhd().with_input(futures::stream::iter([
        PsValue::from("disk1.vhdx"),
        PsValue::from("disk2.vhdx"),
    ]));
    let mut stream = run_pipeline(lease, pipeline, ErrorPolicy::PassThrough, &ctx);
    let collector = tokio::spawn(async move {
        let mut count = 0;
        while let Some(item) = stream.next().await {
            item.unwrap();
            count += 1;
        }
        count
    });

    let mut input = loop {
        if let Some(rx) = runspace.take_input_receiver() {
            break rx;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    };

    assert_eq!(input.next().await, Some(PsValue::from("disk1.vhdx")));
    assert_eq!(input.next().await, Some(PsValue::from("disk2.vhdx")));
    assert_eq!(input.next().await, None);

    runspace.finish_current(PsInvocationState::Completed.into());
    assert_eq!(collector.await.unwrap(), 0);
}

#[tokio::test]
async fn test_policies_on_execution_stream() {
    let script = vec![
        ScriptStep::output(1),
        ScriptStep::output(2),
        ScriptStep::error("E"),
        ScriptStep::completed(),
    ];
    let ctx = InvocationContext::default();

    let (pool, _factory) = mock_pool(1, script.clone());
    let lease = pool.lease(&ctx).await.unwrap();
    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::terminate_on_error(), &ctx)).await;
    assert_eq!(
        items,
        vec![PsItem::Value(PsValue::Int(1)), PsItem::Value(PsValue::Int(2))]
    );
    assert!(error.is_none());
    assert_eq!(pool.status().rented, 0);

    let (pool, _factory) = mock_pool(1, script);
    let lease = pool.lease(&ctx).await.unwrap();
    let (items, error) = collect(run_pipeline(lease, get_vhd(), ErrorPolicy::fail_on_error(), &ctx)).await;
    assert_eq!(
        items,
        vec![PsItem::Value(PsValue::Int(1)), PsItem::Value(PsValue::Int(2))]
    );
    assert!(matches!(error, Some(PoolError::Remote(record)) if record.message == "E"));
    assert_eq!(pool.status().rented, 0);
}
