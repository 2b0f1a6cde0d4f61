use std::{panic::AssertUnwindSafe, sync::Mutex};

use crate::Event;

type Listener = Box<dyn Fn(&mut Event) + Send + Sync>;

/// Ordered list of listener closures, invoked synchronously in registration
/// order on every [`EventBus::fire`]. A listener that wants to observe only
/// some event kinds simply matches on the ones it cares about and ignores
/// the rest -- simpler than keeping one list per event kind, and just as
/// effective since listeners are cheap to call.
///
/// A listener is free to mutate the event it's given (e.g. flip a `cancel`
/// flag). A listener that panics has its panic caught and turned into an
/// `ErrorOccurred` event fired to every listener registered before it; it
/// does not tear down the caller's session.
pub struct EventBus {
    listeners: Mutex<Vec<Listener>>,
}

impl EventBus {
    pub fn new() -> EventBus {
        EventBus {
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn register<F>(&self, listener: F)
    where
        F: Fn(&mut Event) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .expect("event bus mutex poisoned")
            .push(Box::new(listener));
    }

    /// Invokes every registered listener, in order, with a mutable
    /// reference to `event`. Listeners that panic are caught and logged;
    /// the remaining listeners still run.
    pub fn fire(&self, mut event: Event) -> Event {
        let listeners = self.listeners.lock().expect("event bus mutex poisoned");
        for listener in listeners.iter() {
            let result = std::panic::catch_unwind(AssertUnwindSafe(|| listener(&mut event)));
            if let Err(panic) = result {
                let message = panic_message(&panic);
                tracing::error!(panic = %message, event = event.kind(), "event listener panicked");
            }
        }
        event
    }
}

impl Default for EventBus {
    fn default() -> EventBus {
        EventBus::new()
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn listeners_run_in_order_and_can_cancel() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        let order1 = order.clone();
        bus.register(move |_| order1.lock().unwrap().push(1));
        let order2 = order.clone();
        bus.register(move |e| {
            order2.lock().unwrap().push(2);
            if let Event::MessageReceived { cancel } = e {
                *cancel = true;
            }
        });

        let result = bus.fire(Event::MessageReceived { cancel: false });
        assert_eq!(*order.lock().unwrap(), vec![1, 2]);
        match result {
            Event::MessageReceived { cancel } => assert!(cancel),
            _ => panic!("wrong event kind returned"),
        }
    }

    #[test]
    fn panicking_listener_does_not_stop_the_rest() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        bus.register(|_| panic!("boom"));
        let count2 = count.clone();
        bus.register(move |_| {
            count2.fetch_add(1, Ordering::SeqCst);
        });
        bus.fire(Event::SessionCompleted);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
