use std::{cmp::Reverse, sync::Arc, time::Duration};

use async_lock::Semaphore;
use futures::StreamExt;
use smol::{Executor, Timer};

use crate::{
    send_queued_mail::send_queued_mail, Config, InflightMail, QueuedMail, RelayMessages, Storage,
    Transport,
};

/// How often the dispatch loop re-scans the queue for mail that has come
/// due. A filesystem watch would be more responsive, but polling is the
/// simplification this workspace already documented as good enough for a
/// first cut.
const SCAN_INTERVAL: Duration = Duration::from_secs(30);

/// How long a mail may sit in the in-flight directory before the sweep
/// assumes the worker that was sending it crashed and puts it back in the
/// ready queue.
const INFLIGHT_STALE_AFTER: Duration = Duration::from_secs(3600);

/// Spawns the dispatch loop (drains due mail as it is found) and the
/// crash-recovery sweep (returns stale in-flight mail to the queue) onto
/// `ex`. Both run until `ex` itself is dropped.
pub fn spawn<M, Cfg, Stor, Transp>(
    ex: Arc<Executor<'static>>,
    config: Arc<Cfg>,
    storage: Arc<Stor>,
    transport: Arc<Transp>,
    relay_messages: RelayMessages<M>,
) where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
    Transp: Transport<M>,
{
    let semaphore = Arc::new(Semaphore::new(config.max_concurrent_deliveries()));

    {
        let ex2 = ex.clone();
        let config = config.clone();
        let storage = storage.clone();
        let transport = transport.clone();
        let relay_messages = relay_messages.clone();
        ex.spawn(async move {
            loop {
                dispatch_ready(&ex2, &config, &storage, &transport, &relay_messages, &semaphore)
                    .await;
                Timer::after(SCAN_INTERVAL).await;
            }
        })
        .detach();
    }

    ex.spawn(async move {
        loop {
            sweep_stale_inflight(&config, &storage).await;
            Timer::after(INFLIGHT_STALE_AFTER).await;
        }
    })
    .detach();
}

/// Scans for due mail, sorts it highest-priority-first (ties broken by how
/// long it's been due), and spawns one delivery attempt per mail -- gated by
/// `semaphore` so that at most `Config::max_concurrent_deliveries` attempts
/// run at once regardless of how much mail is ready at once.
async fn dispatch_ready<M, Cfg, Stor, Transp>(
    ex: &Arc<Executor<'static>>,
    config: &Arc<Cfg>,
    storage: &Arc<Stor>,
    transport: &Arc<Transp>,
    relay_messages: &RelayMessages<M>,
    semaphore: &Arc<Semaphore>,
) where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
    Transp: Transport<M>,
{
    let now = chrono::Utc::now();
    let mut due = Vec::new();
    let mut stream = storage.list_queue().await;
    while let Some(res) = stream.next().await {
        match res {
            Ok(mail) => {
                if mail.scheduled_at() <= now {
                    due.push(mail);
                }
            }
            Err((err, id)) => config.log_storage_error(err, id).await,
        }
    }
    due.sort_by_key(|mail| (Reverse(mail.priority()), mail.scheduled_at()));

    for mail in due {
        let config = config.clone();
        let storage = storage.clone();
        let transport = transport.clone();
        let relay_messages = relay_messages.clone();
        let semaphore = semaphore.clone();
        ex.spawn(async move {
            let _permit = semaphore.acquire().await;
            send_queued_mail(config, storage, transport, relay_messages, mail).await;
        })
        .detach();
    }
}

async fn sweep_stale_inflight<M, Cfg, Stor>(config: &Arc<Cfg>, storage: &Arc<Stor>)
where
    M: 'static + Clone + Send + Sync,
    Cfg: Config<M, Stor::Error>,
    Stor: Storage<M>,
{
    let mut stream = storage.find_inflight().await;
    while let Some(res) = stream.next().await {
        match res {
            Ok(mail) => {
                let id = mail.id();
                match storage.send_cancel(mail).await {
                    Ok(Some(_)) => (),
                    Ok(None) => config.log_inflight_mail_vanished(id).await,
                    Err((_, err)) => config.log_storage_error(err, Some(id)).await,
                }
            }
            Err((err, id)) => config.log_storage_error(err, id).await,
        }
    }
}
