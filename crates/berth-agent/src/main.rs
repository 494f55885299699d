use std::{future::Future, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinSet;

mod backend;
mod config;
mod error;
mod error_payload;
mod gateway;
mod logs;
mod orchestrator;
mod port_alloc;
mod runtime;
mod runtime_probe;
#[cfg(test)]
mod test_support;
mod tools;
mod ttl_store;

use backend::Backend;
use config::AgentConfig;
use logs::LogBuffer;
use port_alloc::TcpPortProbe;
use runtime::{ContainerRuntime, DockerCli};

const WRITER_GRACE: Duration = Duration::from_secs(5);

/// Waits for every in-flight request. If `stop` resolves first, the rest are aborted.
async fn finish_inflight(inflight: &mut JoinSet<()>, stop: impl Future<Output = ()>) {
    tokio::pin!(stop);
    loop {
        tokio::select! {
            next = inflight.join_next() => {
                if next.is_none() {
                    return;
                }
            }
            _ = &mut stop => {
                tracing::info!(abandoned = inflight.len(), "aborting in-flight requests");
                inflight.abort_all();
                while inflight.join_next().await.is_some() {}
                return;
            }
        }
    }
}

/// Newline-delimited requests on stdin, one response line each on stdout. Requests run
/// concurrently; responses are written in completion order and matched by `id`.
async fn serve_stdio(backend: Arc<Backend>) -> anyhow::Result<()> {
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let writer = tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        while let Some(line) = rx.recv().await {
            stdout.write_all(line.as_bytes()).await?;
            stdout.write_all(b"\n").await?;
            stdout.flush().await?;
        }
        anyhow::Ok(())
    });

    let mut inflight = JoinSet::new();
    let mut interrupted = false;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let next = tokio::select! {
            line = lines.next_line() => line.context("read stdin")?,
            Some(done) = inflight.join_next() => {
                if let Err(e) = done {
                    tracing::error!(error = %e, "request task failed");
                }
                continue;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                interrupted = true;
                break;
            }
        };
        let Some(line) = next else {
            tracing::info!("stdin closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let backend = backend.clone();
        let tx = tx.clone();
        inflight.spawn(async move {
            let resp = tools::handle_line(&backend, &line).await;
            let _ = tx.send(resp);
        });
    }

    if interrupted {
        finish_inflight(&mut inflight, std::future::ready(())).await;
    } else {
        // Closed stdin still gets its answers; Ctrl-C cuts that short.
        finish_inflight(&mut inflight, async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await;
    }

    drop(tx);
    match tokio::time::timeout(WRITER_GRACE, writer).await {
        Ok(joined) => joined.context("join stdout writer")??,
        Err(_) => tracing::warn!("stdout writer did not drain in time"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = AgentConfig::load().context("load configuration")?;
    let log_buffer = LogBuffer::new(cfg.log_max_lines);
    let _log_guard = logs::init_tracing(&cfg, &log_buffer);

    tracing::info!(
        image = %cfg.image,
        port = cfg.preferred_port,
        runtime = %cfg.runtime_bin,
        store = %cfg.store_dir.display(),
        "berth-agent starting"
    );

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(DockerCli::new(cfg.runtime_bin.clone()));
    let backend = Backend::open(cfg, runtime, Arc::new(TcpPortProbe), log_buffer)
        .await
        .context("open task store")?;
    let backend = Arc::new(backend);

    serve_stdio(backend.clone()).await?;

    if backend.config().stop_on_exit {
        let stopped = backend.stop_backing_service().await;
        tracing::info!(stopped, "backing service stopped on exit");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;

    fn slow_request(set: &mut JoinSet<()>, delay: Duration) -> Arc<AtomicBool> {
        let answered = Arc::new(AtomicBool::new(false));
        let flag = answered.clone();
        set.spawn(async move {
            tokio::time::sleep(delay).await;
            flag.store(true, Ordering::SeqCst);
        });
        answered
    }

    #[tokio::test]
    async fn interrupt_aborts_requests_instead_of_waiting() {
        let mut set = JoinSet::new();
        let answered = slow_request(&mut set, Duration::from_secs(60));

        tokio::time::timeout(
            Duration::from_secs(1),
            finish_inflight(&mut set, std::future::ready(())),
        )
        .await
        .unwrap();
        assert!(set.is_empty());
        assert!(!answered.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn requests_finish_when_not_interrupted() {
        let mut set = JoinSet::new();
        let fast = slow_request(&mut set, Duration::from_millis(10));
        let slower = slow_request(&mut set, Duration::from_millis(30));

        finish_inflight(&mut set, std::future::pending()).await;
        assert!(fast.load(Ordering::SeqCst));
        assert!(slower.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn late_interrupt_cuts_the_wait_short() {
        let mut set = JoinSet::new();
        let fast = slow_request(&mut set, Duration::from_millis(5));
        let stuck = slow_request(&mut set, Duration::from_secs(60));

        let stop = tokio::time::sleep(Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(1), finish_inflight(&mut set, stop))
            .await
            .unwrap();
        assert!(fast.load(Ordering::SeqCst));
        assert!(!stuck.load(Ordering::SeqCst));
    }
}
