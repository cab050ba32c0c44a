use std::{
    sync::mpsc::{self, RecvTimeoutError},
    thread::JoinHandle,
    time::Duration,
};

use rand::{thread_rng, Rng};

use crate::{Error, Result};

/// A background thread that calls `poll` right away and then once per interval until stopped.
pub(crate) struct PollerThread {
    join_handle: JoinHandle<()>,

    /// Used to send a stop command to the poller thread.
    stop_sender: mpsc::Sender<()>,
}

impl PollerThread {
    pub fn start(
        interval: Duration,
        max_jitter: Duration,
        mut poll: impl FnMut() + Send + 'static,
    ) -> Result<PollerThread> {
        let (stop_sender, stop_receiver) = mpsc::channel::<()>();

        let join_handle = std::thread::Builder::new()
            .name("remote-flags-poller".to_owned())
            .spawn(move || loop {
                poll();

                let timeout = jitter(interval, max_jitter);
                match stop_receiver.recv_timeout(timeout) {
                    Err(RecvTimeoutError::Timeout) => {
                        // Timed out. Loop to poll again.
                    }
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                        // Either asked to stop, or the owner is gone and nobody can ask anymore.
                        log::debug!(target: "remote_flags", "poller thread stopping");
                        return;
                    }
                }
            })?;

        Ok(PollerThread {
            join_handle,
            stop_sender,
        })
    }

    /// Stop the poller thread.
    ///
    /// This function does not wait for the thread to actually stop.
    pub fn stop(&self) {
        // Error means that the receiver was dropped (thread exited). Ignoring it as there's nothing
        // useful we can do.
        let _ = self.stop_sender.send(());
    }

    /// Stop the poller thread and block waiting for it to exit.
    pub fn shutdown(self) -> Result<()> {
        self.stop();

        // Error means that the thread has panicked and there's nothing useful we can do in that
        // case.
        self.join_handle.join().map_err(|_| Error::WorkerPanicked)?;

        Ok(())
    }
}

/// Apply a random jitter to `interval`.
fn jitter(interval: Duration, jitter: Duration) -> Duration {
    if jitter.is_zero() {
        return interval;
    }
    interval + thread_rng().gen_range(Duration::ZERO..jitter)
}
