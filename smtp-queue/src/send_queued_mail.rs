use std::sync::Arc;

use chrono::Utc;

use crate::{
    bounce, Config, InflightMail, QueuedMail, RelayMessages, ScheduleInfo, Storage, Transport,
    TransportSender,
};

/// Attempts one delivery of a single queued mail: claims it, reads its
/// content back, resolves and connects to its destination, and sends it.
/// On transient failure it is rescheduled according to `Config::next_interval`;
/// on permanent failure, or once retries are exhausted, it is removed from
/// the queue for good and folded into its parent `RelayMessage`, generating
/// a bounce back to the sender if one ends up becoming due.
pub async fn send_queued_mail<M, Cfg, Stor, Transp>(
    config: Arc<Cfg>,
    storage: Arc<Stor>,
    transport: Arc<Transp>,
    relay_messages: RelayMessages<M>,
    mail: Stor::QueuedMail,
) where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
    Transp: Transport<M>,
{
    let id = mail.id();
    let sched = ScheduleInfo {
        at: mail.scheduled_at(),
        last_attempt: mail.last_attempt(),
    };

    let inflight = match storage.send_start(mail).await {
        Ok(Some(inflight)) => inflight,
        Ok(None) => return config.log_queued_mail_vanished(id).await,
        Err((_, err)) => return config.log_storage_error(err, Some(id)).await,
    };

    let (meta, reader) = match storage.read_inflight(&inflight).await {
        Ok(v) => v,
        Err(err) => {
            requeue_or_drop(&config, &storage, inflight, sched, err, id).await;
            return;
        }
    };

    let outcome = async {
        let dest = transport.destination(&meta).await?;
        let mut sender = transport.connect(&dest).await?;
        sender.send(&meta, reader).await
    }
    .await;

    match outcome {
        Ok(()) => {
            if let Err((_, err)) = storage.send_done(inflight).await {
                config.log_storage_error(err, Some(id)).await;
            }
        }
        Err(failure) => {
            let retry_delay = if failure.is_transient() {
                config.next_interval(sched).await
            } else {
                None
            };
            match retry_delay {
                Some(delay) => {
                    let mut qm = match storage.send_cancel(inflight).await {
                        Ok(Some(qm)) => qm,
                        Ok(None) => return config.log_inflight_mail_vanished(id).await,
                        Err((_, err)) => return config.log_storage_error(err, Some(id)).await,
                    };
                    let at = Utc::now()
                        + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
                    if let Err(err) = storage.reschedule(&mut qm, at, Some(Utc::now())).await {
                        config.log_storage_error(err, Some(id)).await;
                    }
                }
                None => {
                    // Permanent failure, or a transient one with retries
                    // exhausted: this mail is done for good. Fold the
                    // outcome into its parent `RelayMessage` (possibly
                    // triggering a bounce) before dropping it from storage,
                    // so it isn't left behind with a stale schedule that the
                    // next scan would immediately retry.
                    bounce::record_terminal_failure(
                        &config,
                        &storage,
                        &relay_messages,
                        &meta,
                        format!("{:?}", failure),
                    )
                    .await;
                    if let Err((_, err)) = storage.send_terminate(inflight).await {
                        config.log_storage_error(err, Some(id)).await;
                    }
                }
            }
        }
    }
}

async fn requeue_or_drop<M, Cfg, Stor>(
    config: &Arc<Cfg>,
    storage: &Arc<Stor>,
    inflight: Stor::InflightMail,
    _sched: ScheduleInfo,
    err: Stor::Error,
    id: crate::QueueId,
) where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
{
    config.log_storage_error(err, Some(id.clone())).await;
    if let Err((_, err)) = storage.send_cancel(inflight).await {
        config.log_storage_error(err, Some(id)).await;
    }
}
