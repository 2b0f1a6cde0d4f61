use std::sync::Arc;

use futures::AsyncWriteExt;
use smtp_message::Email;

use crate::{Config, MailMetadata, Priority, RelayMessages, Storage, StorageEnqueuer};

/// Whether `contents` (the raw RFC 5322 message, headers then body) carries
/// an `Auto-Submitted` header with a value other than `no`. Scans only the
/// header block, ie. up to the first blank line, the way a real header
/// parser would -- a generated bounce always sets this itself, so checking
/// it before bouncing a bounce is what actually breaks the loop, as opposed
/// to guessing from the envelope sender or a `postmaster` localpart.
pub fn is_auto_submitted(contents: &[u8]) -> bool {
    let header_end = contents
        .windows(2)
        .position(|w| w == b"\n\n")
        .or_else(|| contents.windows(4).position(|w| w == b"\r\n\r\n"))
        .unwrap_or(contents.len());
    let headers = &contents[..header_end];
    for line in headers.split(|&b| b == b'\n') {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        if let Some(value) = strip_header_name(line, b"auto-submitted") {
            let value = std::str::from_utf8(value).unwrap_or("").trim();
            return !value.eq_ignore_ascii_case("no");
        }
    }
    false
}

fn strip_header_name<'a>(line: &'a [u8], name: &[u8]) -> Option<&'a [u8]> {
    if line.len() <= name.len() || line[name.len()] != b':' {
        return None;
    }
    let (candidate, rest) = line.split_at(name.len());
    if candidate.eq_ignore_ascii_case(name) {
        Some(&rest[1..])
    } else {
        None
    }
}

/// Renders a plain-text non-delivery report body listing every recipient
/// that could not be delivered to, and why.
fn render_bounce(original_sender: &Email, failed: &[(Email, String)]) -> Vec<u8> {
    let mut body = String::new();
    body.push_str("This is an automatically generated delivery status notification.\r\n\r\n");
    body.push_str("Delivery to the following recipient(s) failed permanently:\r\n\r\n");
    for (to, error) in failed {
        body.push_str(&format!("  {}\r\n    {}\r\n", to, error));
    }

    let mut out = String::new();
    out.push_str("Auto-Submitted: auto-replied\r\n");
    out.push_str("Content-Type: text/plain; charset=utf-8\r\n");
    out.push_str("Subject: Undelivered Mail Returned to Sender\r\n");
    out.push_str(&format!("To: {}\r\n", original_sender));
    out.push_str("\r\n");
    out.push_str(&body);
    out.into_bytes()
}

/// Folds a single recipient's terminal outcome (permanent failure, or a
/// transient one with retries exhausted) into its parent `RelayMessage`. If
/// this was the last pending recipient and the message as a whole ended up
/// `Failed` or `PartiallyDelivered`, generates and enqueues a bounce back to
/// the original sender, provided one is configured and the original message
/// was not itself a bounce.
pub async fn record_terminal_failure<M, Cfg, Stor>(
    config: &Arc<Cfg>,
    storage: &Arc<Stor>,
    relay_messages: &RelayMessages<M>,
    meta: &MailMetadata<M>,
    error: String,
) where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
{
    let resolved = match relay_messages.get_mut(&meta.parent) {
        Some(mut entry) => {
            entry.pending.retain(|to| *to != meta.to);
            entry.failed.push((meta.to.clone(), error));
            entry.last_error = entry.failed.last().map(|(_, e)| e.clone());
            entry.pending.is_empty()
        }
        None => return,
    };
    if !resolved {
        return;
    }

    let snapshot = relay_messages.remove(&meta.parent).map(|(_, v)| v);
    let relay_message = match snapshot {
        Some(m) => m,
        None => return,
    };
    if relay_message.auto_submitted || relay_message.failed.is_empty() {
        return;
    }

    let (bounce_from, original_sender) = match (config.bounce_sender(), relay_message.from.clone()) {
        (Some(bounce_from), Some(original_sender)) => (bounce_from, original_sender),
        _ => return,
    };

    let contents = render_bounce(&original_sender, &relay_message.failed);
    let bounce_meta = MailMetadata {
        from: Some(bounce_from),
        to: original_sender,
        metadata: relay_message.metadata.clone(),
        priority: Priority::High,
        parent: meta.parent.clone(),
    };

    let mut enqueuer = match storage.enqueue(bounce_meta).await {
        Ok(e) => e,
        Err(err) => return config.log_storage_error(err, Some(meta.parent.clone())).await,
    };
    if let Err(err) = enqueuer.write_all(&contents).await.map_err(Stor::Error::from) {
        return config.log_storage_error(err, Some(meta.parent.clone())).await;
    }
    if let Err(err) = enqueuer.close().await.map_err(Stor::Error::from) {
        return config.log_storage_error(err, Some(meta.parent.clone())).await;
    }
    if let Err(err) = enqueuer.commit().await.map_err(Stor::Error::from) {
        config.log_storage_error(err, Some(meta.parent.clone())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_auto_submitted_header() {
        let msg = b"From: a@x.com\r\nAuto-Submitted: auto-replied\r\n\r\nbody";
        assert!(is_auto_submitted(msg));
    }

    #[test]
    fn no_value_is_not_auto_submitted() {
        let msg = b"From: a@x.com\r\nAuto-Submitted: no\r\n\r\nbody";
        assert!(!is_auto_submitted(msg));
    }

    #[test]
    fn absent_header_is_not_auto_submitted() {
        let msg = b"From: a@x.com\r\nSubject: hi\r\n\r\nbody";
        assert!(!is_auto_submitted(msg));
    }
}
