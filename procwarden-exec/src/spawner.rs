//! The executor's forking thread.
//!
//! Attached children carry a parent-death signal, and Linux delivers it when
//! the thread that forked them exits, not the process. Every fork therefore
//! happens on one named thread owned by the executor, so a child outlives
//! whichever thread asked for it and dies with the executor instead.

use std::io;
use std::sync::mpsc;
use std::thread;

use procwarden_config::ExecutorConfig;
use tokio::runtime::Handle;

use crate::pipe::{self, SpawnError, SpawnedChild};
use crate::spec::CommandSpec;

type SpawnResult = Result<SpawnedChild, SpawnError>;

struct Request {
    spec: CommandSpec,
    reply: mpsc::SyncSender<SpawnResult>,
}

pub(crate) struct Spawner {
    requests: Option<mpsc::Sender<Request>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Spawner {
    /// Start the thread. Reader and stdin tasks of every child land on the
    /// runtime behind `runtime`.
    pub fn start(runtime: Handle, config: ExecutorConfig) -> io::Result<Self> {
        let (requests, inbox) = mpsc::channel::<Request>();
        let thread = thread::Builder::new()
            .name("procwarden-spawner".to_string())
            .spawn(move || {
                let _context = runtime.enter();
                for Request { spec, reply } in inbox {
                    let spawned = pipe::spawn(&spec, &config);
                    if let Err(Ok(orphan)) = reply.send(spawned).map_err(|err| err.0) {
                        // The caller went away between request and reply.
                        tracing::warn!(pid = %orphan.handle.pid(), "spawn reply dropped");
                    }
                }
                tracing::debug!("spawner thread stopped");
            })?;
        Ok(Self {
            requests: Some(requests),
            thread: Some(thread),
        })
    }

    /// Fork `spec` on the spawner thread and wait for the result.
    pub fn spawn(&self, spec: &CommandSpec) -> SpawnResult {
        let stopped = || SpawnError::SpawnerStopped {
            program: spec.program().unwrap_or_default().to_string(),
        };
        let requests = self.requests.as_ref().ok_or_else(stopped)?;
        let (reply, response) = mpsc::sync_channel(1);
        requests
            .send(Request {
                spec: spec.clone(),
                reply,
            })
            .map_err(|_| stopped())?;
        response.recv().map_err(|_| stopped())?
    }

    /// Close the request channel and join the thread. Attached children
    /// spawned so far receive their parent-death signal.
    pub fn stop(&mut self) {
        self.requests.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            tracing::error!("spawner thread panicked");
        }
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        self.stop();
    }
}
