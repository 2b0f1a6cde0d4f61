use std::time::Duration;

use chrono::Utc;
use futures::{AsyncWriteExt, StreamExt};
use smtp_message::Email;
use smtp_queue::{InflightMail, MailMetadata, Priority, QueueId, QueuedMail, Storage, StorageEnqueuer};
use smtp_queue_fs::FsStorage;
use tempdir::TempDir;

fn local_email(user: &str) -> Email {
    let addr = format!("<{}@example.org>", user);
    Email::<String>::parse_bracketed(addr.as_bytes()).unwrap()
}

/// Walks a single mail through a failed-then-retried delivery: enqueue,
/// claim it for delivery, simulate a transient failure by cancelling the
/// in-flight attempt, reschedule it further out, and check it comes back
/// out of `list_queue` with the new schedule.
#[test]
fn failed_delivery_is_rescheduled_and_reappears_in_the_queue() {
    smol::block_on(async {
        let root = TempDir::new("smtp-queue-fs-retry-test").unwrap();
        for dir in ["data", "queue", "inflight", "cleanup"] {
            std::fs::create_dir_all(root.path().join(dir)).unwrap();
        }

        let storage: FsStorage<()> = FsStorage::new(root.path().to_owned()).await.unwrap();

        let meta = MailMetadata {
            from: Some(local_email("alice")),
            to: local_email("bob"),
            metadata: (),
            priority: Priority::Normal,
            parent: QueueId::new("queue-retry-test"),
        };
        let mut enqueuer = storage.enqueue(meta).await.unwrap();
        enqueuer.write_all(b"Subject: retry test\r\n\r\nBody\r\n").await.unwrap();
        enqueuer.close().await.unwrap();
        let mut queued = enqueuer.commit().await.unwrap();
        let id = queued.id();

        storage
            .reschedule(&mut queued, Utc::now(), None)
            .await
            .unwrap();

        // First delivery attempt: claim it, then simulate a transient
        // failure by cancelling the in-flight claim, which hands back a
        // fresh `FsQueuedMail` to reschedule.
        let inflight = storage
            .send_start(queued)
            .await
            .unwrap()
            .expect("mail should still be present in the queue");
        let mut requeued = storage
            .send_cancel(inflight)
            .await
            .unwrap()
            .expect("mail should come back from a cancelled in-flight attempt");

        let retry_at = Utc::now() + chrono::Duration::from_std(Duration::from_secs(60)).unwrap();
        storage
            .reschedule(&mut requeued, retry_at, Some(Utc::now()))
            .await
            .unwrap();

        let mut found = storage.list_queue().await;
        let mut seen = false;
        while let Some(item) = found.next().await {
            let item = item.unwrap();
            if item.id() == id {
                seen = true;
                assert!(item.last_attempt().is_some());
                assert_eq!(item.scheduled_at(), retry_at);
            }
        }
        assert!(seen, "rescheduled mail should still be visible in the queue");
    });
}

#[test]
fn retry_backoff_grows_and_saturates_at_the_configured_maximum() {
    let base = Duration::from_secs(60);
    let max = Duration::from_secs(3600);

    let first = smtp_queue::retry_backoff(base, 0, max, 0.5);
    let later = smtp_queue::retry_backoff(base, 3, max, 0.5);
    let saturated = smtp_queue::retry_backoff(base, 20, max, 0.5);

    assert!(first <= base + Duration::from_secs(10));
    assert!(later > first);
    assert!(saturated <= max + Duration::from_secs(10));
}
