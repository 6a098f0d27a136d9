//! PROCESS backend: dispatches to a freshly-spawned worker process.
//! See `spec.md` §4.2 and §9 ("the serialization boundary must be made
//! explicit").
//!
//! Unlike the source system, a Rust closure cannot be pickled across a
//! process boundary. Instead, the worker process is a re-exec of the same
//! binary (`std::env::current_exe()`), told which handler to run via an
//! environment variable. The hosting application must call
//! [`maybe_enter_worker`] at the top of its own `main`, before doing
//! anything else — the same shape as Python multiprocessing's
//! `if __name__ == "__main__"` guard. Payload and result cross the pipe as
//! one length-prefixed JSON frame each way.
use std::collections::HashMap;
use std::hash::Hash;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use corral_core::{BackendError, CorralError, HandlerDescriptor, Registry};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Environment variable a worker process reads to learn which handler to
/// run. Set by the parent when it spawns the worker; absent in the parent
/// process and in any normally-started application.
///
/// Carries the handler's diagnostic *name*, not its [`corral_core::HandlerId`]:
/// an id is a fresh `Uuid::now_v7()` generated at registration time in
/// every process, so the id the parent sees is never the one the child
/// generates for the "same" handler. The name is the only identifier that
/// survives the re-exec, which is why `Backend::Process` handlers must be
/// registered with an explicit `RegisterOptions::with_name`.
pub const WORKER_HANDLER_NAME_ENV: &str = "CORRAL_WORKER_HANDLER_NAME";

#[derive(Debug, Serialize, Deserialize)]
enum WireOutcome<O> {
    Ok(O),
    Err(String),
}

#[derive(Debug, thiserror::Error)]
#[error("{0}")]
struct RemoteError(String);

/// Tracks worker processes that are currently in flight so that
/// [`crate::Executor::stop`] can terminate any still-running ones after
/// its drain deadline (`spec.md` §4.2: "on Executor shutdown, remaining
/// worker processes are terminated after a grace period").
#[derive(Clone, Default)]
pub(crate) struct ProcessRegistry {
    children: Arc<Mutex<HashMap<Uuid, Child>>>,
}

impl ProcessRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    fn register(&self, id: Uuid, child: Child) {
        self.children
            .lock()
            .expect("process registry lock poisoned")
            .insert(id, child);
    }

    fn remove(&self, id: Uuid) {
        self.children
            .lock()
            .expect("process registry lock poisoned")
            .remove(&id);
    }

    /// Sends a kill signal to every still-registered worker process. Used
    /// after the executor's drain deadline elapses.
    pub(crate) fn kill_all(&self) {
        let mut guard = self.children.lock().expect("process registry lock poisoned");
        for (_, mut child) in guard.drain() {
            let _ = child.start_kill();
        }
    }
}

pub(crate) async fn run<P, O>(
    descriptor: &HandlerDescriptor<P, O>,
    payload: P,
    cancel: &CancellationToken,
    processes: &ProcessRegistry,
) -> Result<O, CorralError>
where
    P: Serialize + Send + 'static,
    O: DeserializeOwned + Send + 'static,
{
    let payload_bytes =
        serde_json::to_vec(&payload).map_err(|_| CorralError::Backend(BackendError::NotSerializable))?;

    let exe = std::env::current_exe().map_err(|e| CorralError::Backend(BackendError::Spawn(e)))?;
    let mut child = tokio::process::Command::new(exe)
        .env(WORKER_HANDLER_NAME_ENV, descriptor.name())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|e| CorralError::Backend(BackendError::Spawn(e)))?;

    let mut stdin = child.stdin.take().expect("piped stdin");
    let mut stdout = child.stdout.take().expect("piped stdout");

    let call_id = Uuid::now_v7();
    processes.register(call_id, child);

    let processes = processes.clone();
    let task = tokio::spawn(async move {
        let outcome = async {
            write_frame(&mut stdin, &payload_bytes)
                .await
                .map_err(protocol_error)?;
            drop(stdin);
            let frame = read_frame(&mut stdout).await.map_err(protocol_error)?;
            let outcome: WireOutcome<O> = serde_json::from_slice(&frame)
                .map_err(|e| CorralError::Backend(BackendError::Protocol(e.to_string())))?;
            match outcome {
                WireOutcome::Ok(value) => Ok(value),
                WireOutcome::Err(message) => Err(CorralError::handler(RemoteError(message))),
            }
        }
        .await;
        processes.remove(call_id);
        outcome
    });

    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(CorralError::Cancelled),
        joined = task => match joined {
            Ok(result) => result,
            Err(join_err) => Err(CorralError::Backend(BackendError::Protocol(join_err.to_string()))),
        },
    }
}

fn protocol_error(err: std::io::Error) -> CorralError {
    CorralError::Backend(BackendError::Protocol(err.to_string()))
}

async fn write_frame(
    writer: &mut (impl tokio::io::AsyncWrite + Unpin),
    bytes: &[u8],
) -> std::io::Result<()> {
    writer.write_u32(bytes.len() as u32).await?;
    writer.write_all(bytes).await?;
    writer.flush().await
}

async fn read_frame(reader: &mut (impl tokio::io::AsyncRead + Unpin)) -> std::io::Result<Vec<u8>> {
    let len = reader.read_u32().await?;
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Runs as a worker process and never returns, if this process was spawned
/// by the PROCESS backend; otherwise returns `false` immediately.
///
/// Call this at the very top of your `main`, after constructing the exact
/// same [`Registry`] the parent process built (same handlers, same
/// registration order — registration must be deterministic). If it
/// returns, no worker invocation was requested and normal startup should
/// continue.
pub async fn maybe_enter_worker<Key, Payload, Out>(registry: &Registry<Key, Payload, Out>) -> bool
where
    Key: Eq + Hash + Clone,
    Payload: DeserializeOwned + Send + 'static,
    Out: Serialize + Send + 'static,
{
    let Ok(name) = std::env::var(WORKER_HANDLER_NAME_ENV) else {
        return false;
    };

    let Some(descriptor) = registry.find_by_name(&name) else {
        worker_fatal("worker process could not find its handler in the registry");
    };

    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let frame = match read_frame(&mut stdin).await {
        Ok(frame) => frame,
        Err(err) => worker_fatal(&format!("failed to read payload frame: {err}")),
    };
    let payload: Payload = match serde_json::from_slice(&frame) {
        Ok(payload) => payload,
        Err(err) => worker_fatal(&format!("failed to decode payload: {err}")),
    };

    let outcome: WireOutcome<Out> = match descriptor.call(payload).await {
        Ok(result) => WireOutcome::Ok(result),
        Err(err) => WireOutcome::Err(err.to_string()),
    };
    let bytes = serde_json::to_vec(&outcome).expect("worker outcome is serializable");
    if write_frame(&mut stdout, &bytes).await.is_err() {
        std::process::exit(1);
    }
    true
}

fn worker_fatal(message: &str) -> ! {
    tracing::error!(target: crate::TRACING_TARGET, message, "worker process failed");
    std::process::exit(1);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread")]
    async fn frame_round_trips() {
        let mut buf: Vec<u8> = Vec::new();
        write_frame(&mut buf, b"hello").await.unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let frame = read_frame(&mut cursor).await.unwrap();
        assert_eq!(frame, b"hello");
    }

    #[test]
    fn no_env_var_means_not_a_worker() {
        // The test process never sets this variable itself, so its absence
        // here is exactly the condition `maybe_enter_worker` checks for.
        // `std::env::remove_var` is unsafe as of the 2024 edition and this
        // crate forbids unsafe code, so we rely on that absence rather than
        // clearing the variable ourselves.
        assert!(std::env::var(WORKER_HANDLER_NAME_ENV).is_err());
    }
}
