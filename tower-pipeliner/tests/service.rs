//! Tests for the pipeliner handle, tower integration, and worker lifecycle.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use color_eyre::{eyre::eyre, Report};
use once_cell::sync::Lazy;
use tokio::{sync::Semaphore, time::timeout};
use tower::{Layer, Service, ServiceExt};

use pipeliner_test::{RUNTIME, TEST_TIMEOUT};
use tower_pipeliner::{
    doer_fn, BoxError, Config, ConfigError, PipelineError, Pipeliner, PipelinerLayer,
};

/// The sum of every item stored by [`SHARED`].
static SHARED_TOTAL: AtomicU64 = AtomicU64::new(0);

/// A global pipeliner, like the ones used for process-wide write coalescing.
///
/// It spawns its worker on the shared runtime, so every test using it must
/// run on [`RUNTIME`].
static SHARED: Lazy<Pipeliner<u64>> = Lazy::new(|| {
    let _guard = RUNTIME.enter();

    let doer = doer_fn(|items: Vec<u64>| async move {
        SHARED_TOTAL.fetch_add(items.iter().sum(), Ordering::SeqCst);
        Ok::<(), BoxError>(())
    });

    Pipeliner::new(doer, Config::default().with_window(Duration::from_millis(1), 8))
        .expect("shared pipeliner config is valid")
});

#[tokio::test]
async fn layer_builds_a_working_pipeliner() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let stored = Arc::new(AtomicU64::new(0));
    let doer = {
        let stored = stored.clone();
        doer_fn(move |items: Vec<u64>| {
            stored.fetch_add(items.len() as u64, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        })
    };

    let config = Config::default().with_window(Duration::from_millis(1), 4);
    let layer = PipelinerLayer::<u64>::new(config)?;
    let pipeliner = layer.layer(doer);

    timeout(TEST_TIMEOUT, pipeliner.oneshot(7))
        .await
        .map_err(|e| eyre!(e))??;

    assert_eq!(stored.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn layer_rejects_config_without_flush_trigger() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let error = PipelinerLayer::<u64>::new(Config::default().with_window(Duration::ZERO, 0))
        .expect_err("config can never flush");
    assert_eq!(error, ConfigError::NoFlushTrigger);

    Ok(())
}

#[tokio::test]
async fn cloned_handles_share_one_worker() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let batches = Arc::new(AtomicU64::new(0));
    let doer = {
        let batches = batches.clone();
        doer_fn(move |_items: Vec<u32>| {
            batches.fetch_add(1, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        })
    };

    let config = Config::default().with_window(Duration::from_secs(1000), 2);
    let first = Pipeliner::new(doer, config)?;
    let second = first.clone();

    let (a, b) = timeout(TEST_TIMEOUT, async {
        tokio::join!(first.submit(1), second.submit(2))
    })
    .await
    .map_err(|e| eyre!(e))?;
    a?;
    b?;

    // Both items fill the same batch, so the long window never expires.
    assert_eq!(batches.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn dropping_handles_flushes_pending_items() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let stored = Arc::new(AtomicU64::new(0));
    let doer = {
        let stored = stored.clone();
        doer_fn(move |items: Vec<u64>| {
            stored.fetch_add(items.len() as u64, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        })
    };

    // The window and size limit are never reached, so only shutdown can flush.
    let config = Config::default().with_window(Duration::from_secs(1000), 100);
    let pipeliner = Pipeliner::new(doer, config)?;

    let response = tokio::spawn(pipeliner.submit(1));
    drop(pipeliner);

    timeout(TEST_TIMEOUT, response)
        .await
        .map_err(|e| eyre!(e))???;

    assert_eq!(stored.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn dropped_worker_closes_the_pipeliner() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let doer = doer_fn(|_items: Vec<u32>| async { Ok::<(), BoxError>(()) });
    let config = Config::default().with_window(Duration::from_millis(1), 2);
    let (mut pipeliner, worker) = Pipeliner::pair(doer, config)?;

    drop(worker);

    match pipeliner.ready().await {
        Err(PipelineError::Closed) => {}
        other => return Err(eyre!("expected a closed error, got {other:?}")),
    }

    match pipeliner.submit(1).await {
        Err(PipelineError::Closed) => {}
        other => return Err(eyre!("expected a closed error, got {other:?}")),
    }

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_worker_fails_the_pending_batch() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let (doer, stored) = {
        let stored = Arc::new(AtomicU64::new(0));
        let recorded = stored.clone();
        let doer = doer_fn(move |items: Vec<u32>| {
            recorded.fetch_add(items.len() as u64, Ordering::SeqCst);
            async { Ok::<(), BoxError>(()) }
        });
        (doer, stored)
    };

    // Neither flush trigger fires before the worker is stopped.
    let config = Config::default().with_window(Duration::from_secs(1000), 100);
    let (pipeliner, worker) = Pipeliner::pair(doer, config)?;
    let worker_handle = tokio::spawn(worker.run());

    let response = tokio::spawn(pipeliner.submit(1));

    // Let the worker add the item to its pending batch.
    tokio::time::sleep(Duration::from_millis(10)).await;

    worker_handle.abort();
    assert!(worker_handle.await.is_err_and(|error| error.is_cancelled()));

    match timeout(TEST_TIMEOUT, response).await.map_err(|e| eyre!(e))?? {
        Err(PipelineError::Closed) => {}
        other => return Err(eyre!("expected a closed error, got {other:?}")),
    }

    assert_eq!(stored.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn dropped_worker_fails_queued_items() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    // Batches wait until the test adds permits.
    let gate = Arc::new(Semaphore::new(0));
    let doer = {
        let gate = gate.clone();
        doer_fn(move |_items: Vec<u32>| {
            let gate = gate.clone();
            async move {
                let _permit = gate.acquire().await?;
                Ok::<(), BoxError>(())
            }
        })
    };

    // Each item fills a batch, and only one batch can execute.
    let config = Config::default()
        .with_window(Duration::from_secs(1000), 1)
        .with_concurrency(1);
    let (pipeliner, worker) = Pipeliner::pair(doer, config)?;
    let worker_handle = tokio::spawn(worker.run());

    let executing = tokio::spawn(pipeliner.submit(1));
    tokio::time::sleep(Duration::from_millis(10)).await;

    // The only batch slot is executing, so this item waits in the intake queue.
    let queued = tokio::spawn(pipeliner.submit(2));
    tokio::time::sleep(Duration::from_millis(10)).await;

    worker_handle.abort();
    assert!(worker_handle.await.is_err_and(|error| error.is_cancelled()));

    match timeout(TEST_TIMEOUT, queued).await.map_err(|e| eyre!(e))?? {
        Err(PipelineError::Closed) => {}
        other => return Err(eyre!("expected a closed error, got {other:?}")),
    }

    // Executing batches still deliver their own results.
    gate.add_permits(1);
    timeout(TEST_TIMEOUT, executing)
        .await
        .map_err(|e| eyre!(e))???;

    Ok(())
}

#[tokio::test]
async fn paired_worker_runs_on_caller_executor() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    let doer = doer_fn(|items: Vec<u32>| async move {
        if items.len() == 2 {
            Ok(())
        } else {
            Err::<(), BoxError>(format!("unexpected batch size {}", items.len()).into())
        }
    });
    let config = Config::default().with_window(Duration::from_secs(1000), 2);
    let (mut pipeliner, worker) = Pipeliner::pair(doer, config)?;

    let worker_handle = tokio::spawn(worker.run());
    pipeliner.register_worker(worker_handle);

    let first = pipeliner.ready().await?.call(1);
    let second = pipeliner.ready().await?.call(2);

    let (first, second) = timeout(TEST_TIMEOUT, async { tokio::join!(first, second) })
        .await
        .map_err(|e| eyre!(e))?;
    first?;
    second?;

    Ok(())
}

#[test]
fn shared_pipeliner_on_shared_runtime() -> Result<(), Report> {
    let _init_guard = pipeliner_test::init();

    RUNTIME.block_on(async {
        let submits = (1..=10_u64).map(|item| tokio::spawn(SHARED.submit(item)));

        for submit in submits.collect::<Vec<_>>() {
            submit.await??;
        }

        Ok::<(), Report>(())
    })?;

    // This is the only test that submits to the shared pipeliner.
    assert_eq!(SHARED_TOTAL.load(Ordering::SeqCst), 55);

    Ok(())
}
