use std::thread::{self, JoinHandle};

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use signal_hook::iterator::{Handle, Signals};
use tracing::{error, info, warn};

use crate::errors::ChatError;

/// Signals that end an interactive session.
pub const TERMINATION_SIGNALS: [libc::c_int; 4] = [SIGHUP, SIGINT, SIGQUIT, SIGTERM];

/// Runs a callback on a dedicated thread for each delivered signal.
///
/// The callback only forwards the notification; the shutdown itself runs on
/// the thread that owns the session.
pub struct SignalListener {
    handle: Handle,
    thread: Option<JoinHandle<()>>,
}

impl SignalListener {
    pub fn spawn<F>(signals: &[libc::c_int], mut on_signal: F) -> Result<SignalListener, ChatError>
    where
        F: FnMut(libc::c_int) + Send + 'static,
    {
        let mut signals = Signals::new(signals).map_err(ChatError::SignalHook)?;
        let handle = signals.handle();
        let thread = thread::Builder::new()
            .name("shmchat-signals".to_string())
            .spawn(move || {
                for signal in signals.forever() {
                    info!(signal, "termination requested");
                    on_signal(signal);
                }
            })?;
        Ok(SignalListener {
            handle,
            thread: Some(thread),
        })
    }

    /// Forwards the first termination signal to `on_signal`. Any later one
    /// gets the default action, so a cleanup that hangs can still be killed
    /// with a second Ctrl-C.
    pub fn termination<F>(on_signal: F) -> Result<SignalListener, ChatError>
    where
        F: FnMut(libc::c_int) + Send + 'static,
    {
        SignalListener::spawn(
            &TERMINATION_SIGNALS,
            first_then(on_signal, |signal| {
                warn!(signal, "termination requested again; exiting without cleanup");
                if let Err(e) = signal_hook::low_level::emulate_default_handler(signal) {
                    error!(signal, "cannot apply default signal action: {}", e);
                }
            }),
        )
    }

    /// Unregisters the handlers and waits for the listener thread.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        self.handle.close();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Sends the first signal to `first` and every later one to `again`.
fn first_then<F, G>(mut first: F, mut again: G) -> impl FnMut(libc::c_int) + Send + 'static
where
    F: FnMut(libc::c_int) + Send + 'static,
    G: FnMut(libc::c_int) + Send + 'static,
{
    let mut seen = false;
    move |signal| {
        if seen {
            again(signal);
        } else {
            seen = true;
            first(signal);
        }
    }
}

impl Drop for SignalListener {
    fn drop(&mut self) {
        self.shutdown();
    }
}
