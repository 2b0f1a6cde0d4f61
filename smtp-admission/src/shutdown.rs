use smol::channel;

/// Fired once to ask every listener to wind down. Cloning a [`ShutdownToken`]
/// and handing it to each in-flight session lets the accept loop and every
/// live connection race their own work against the same shutdown signal.
#[derive(Clone)]
pub struct ShutdownToken {
    recv: channel::Receiver<()>,
}

pub struct ShutdownTrigger {
    _send: channel::Sender<()>,
}

/// Builds a trigger/token pair. Dropping (or explicitly calling
/// [`ShutdownTrigger::shutdown`] on) the trigger closes the channel, which
/// wakes every clone of the token's [`ShutdownToken::wait`] future.
pub fn shutdown_channel() -> (ShutdownTrigger, ShutdownToken) {
    let (send, recv) = channel::bounded(1);
    (ShutdownTrigger { _send: send }, ShutdownToken { recv })
}

impl ShutdownTrigger {
    pub fn shutdown(self) {
        drop(self);
    }
}

impl ShutdownToken {
    /// Resolves once the trigger has fired (or been dropped).
    pub async fn wait(&self) {
        // The channel is never sent on; it only ever closes, at which point
        // `recv` resolves to `Err(Closed)` -- that's the shutdown signal.
        let _ = self.recv.recv().await;
    }

    pub fn is_shutting_down(&self) -> bool {
        self.recv.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_resolves_once_trigger_dropped() {
        smol::block_on(async {
            let (trigger, token) = shutdown_channel();
            let token2 = token.clone();
            assert!(!token2.is_shutting_down());
            trigger.shutdown();
            token2.wait().await;
            assert!(token2.is_shutting_down());
        });
    }
}
