//! Subscription handling and notification delivery.
//!
//! Owns the subscription lifecycle (verification requests on add,
//! delta-verification on update, deletion notices on remove), the
//! per-event notification dispatch with `net`/`chty`/`atr` filtering,
//! payload construction by notification content type, batch queues with
//! `num`/`dur`/`ln` semantics, and the expiration counter. Deliveries to
//! established subscriptions are retried a bounded number of times with
//! doubling backoff, then dropped.

use chrono::Utc;
use log::{debug, info, warn};
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::cse::{Cse, DeleteCause};
use crate::error::{CseError, CseResult, ResponseStatusCode};
use crate::event::ResourceEvent;
use crate::resource::{Resource, ResourceType};
use crate::storage::SubscriptionRecord;

/// Notification event types (`enc/net` values).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationEventType {
    ResourceUpdate,
    ResourceDelete,
    CreateDirectChild,
    DeleteDirectChild,
    ReportMissingData,
}

impl NotificationEventType {
    pub fn code(&self) -> i64 {
        match self {
            NotificationEventType::ResourceUpdate => 1,
            NotificationEventType::ResourceDelete => 2,
            NotificationEventType::CreateDirectChild => 3,
            NotificationEventType::DeleteDirectChild => 4,
            NotificationEventType::ReportMissingData => 8,
        }
    }

    fn is_child_event(&self) -> bool {
        matches!(
            self,
            NotificationEventType::CreateDirectChild | NotificationEventType::DeleteDirectChild
        )
    }
}

/// Notification content types (`nct` values).
pub mod content_type {
    pub const ALL: i64 = 1;
    pub const MODIFIED_ATTRIBUTES: i64 = 2;
    pub const RI: i64 = 3;
    pub const TIME_SERIES: i64 = 5;
}

/// Event-category wire value (`X-M2M-EC`) marking a latest-only batch
/// drain.
pub const EVENT_CATEGORY_LATEST: &str = "4";

/// Missing-data bookkeeping for time-series style subscriptions.
#[derive(Debug, Clone, Default)]
pub struct MissingData {
    /// Threshold configured on the subscription
    pub number: usize,
    pub list: Vec<String>,
}

impl MissingData {
    pub fn to_wire(&self) -> Value {
        json!({ "mdlt": self.list, "mdc": self.list.len() })
    }
}

pub struct NotificationManager {
    /// Batch duration workers keyed by `subscriptionRi;nu`
    batch_workers: Mutex<HashMap<String, JoinHandle<()>>>,
    /// Serializes batch drains
    drain_lock: Mutex<()>,
}

impl Default for NotificationManager {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationManager {
    pub fn new() -> Self {
        Self {
            batch_workers: Mutex::new(HashMap::new()),
            drain_lock: Mutex::new(()),
        }
    }

    /// Register a new subscription. Every notification target receives a
    /// verification request first; a single failure aborts the create.
    pub async fn add_subscription(
        &self,
        cse: &Cse,
        resource: &Resource,
        originator: &str,
    ) -> CseResult<()> {
        debug!("adding subscription '{}'", resource.ri());
        let record = SubscriptionRecord::from_resource(resource, originator);
        if cse.config.enable_notifications {
            self.verify_targets(cse, &record, &[], originator).await?;
        }
        cse.storage.add_subscription(record).await?;
        Ok(())
    }

    /// Update a subscription; only targets not yet present in the
    /// previous `nu` list are verified.
    pub async fn update_subscription(
        &self,
        cse: &Cse,
        resource: &Resource,
        previous_nus: &[String],
        originator: &str,
    ) -> CseResult<()> {
        debug!("updating subscription '{}'", resource.ri());
        let stored = cse
            .storage
            .subscription(resource.ri())
            .await?
            .ok_or_else(|| CseError::internal("subscription record missing"))?;
        let record = SubscriptionRecord::from_resource(resource, &stored.originator);
        if cse.config.enable_notifications {
            self.verify_targets(cse, &record, previous_nus, originator)
                .await?;
        }
        cse.storage.update_subscription(record).await?;
        Ok(())
    }

    /// Remove a subscription: flush outstanding batches, then send the
    /// deletion notices. Delivery errors are ignored.
    pub async fn remove_subscription(&self, cse: &Cse, ri: &str) {
        debug!("removing subscription '{ri}'");
        let record = match cse.storage.subscription(ri).await {
            Ok(Some(record)) => record,
            _ => return,
        };
        self.flush_batch_notifications(cse, &record).await;

        if cse.config.enable_notifications {
            let notice = json!({
                "m2m:sgn": { "sud": true, "sur": full_ri(cse, ri) }
            });
            for target in record.nus.iter().chain(record.acrs.iter()) {
                if let Err(err) = cse
                    .requests
                    .send_notify(cse, target, notice.clone(), None)
                    .await
                {
                    debug!("deletion notice to '{target}' failed: {err}");
                }
            }
        }
        let _ = cse.storage.remove_subscription(ri).await;
    }

    async fn verify_targets(
        &self,
        cse: &Cse,
        record: &SubscriptionRecord,
        previous_nus: &[String],
        originator: &str,
    ) -> CseResult<()> {
        for nu in &record.nus {
            if previous_nus.contains(nu) || nu == originator {
                continue;
            }
            debug!("sending verification request to '{nu}'");
            let mut sgn = Map::new();
            sgn.insert("vrq".into(), json!(true));
            sgn.insert("sur".into(), json!(full_ri(cse, &record.ri)));
            if !originator.is_empty() {
                sgn.insert("cr".into(), json!(originator));
            }
            let request = json!({ "m2m:sgn": Value::Object(sgn) });
            if let Err(err) = cse.requests.send_notify(cse, nu, request, None).await {
                warn!("verification request to '{nu}' failed: {err}");
                return Err(CseError::with_debug(
                    ResponseStatusCode::SubscriptionVerificationInitiationFailed,
                    format!("verification request failed for '{nu}'"),
                ));
            }
        }
        Ok(())
    }

    /// Resource-event entry point, called off-request by the event
    /// worker.
    pub async fn on_resource_event(&self, cse: &Arc<Cse>, event: &ResourceEvent) {
        if !cse.config.enable_notifications {
            return;
        }
        match event {
            ResourceEvent::Created { resource, parent_ri } => {
                self.check_subscriptions(
                    cse,
                    parent_ri,
                    NotificationEventType::CreateDirectChild,
                    Some(resource),
                    None,
                )
                .await;
            }
            ResourceEvent::Updated { resource, modified } => {
                self.check_subscriptions(
                    cse,
                    resource.ri(),
                    NotificationEventType::ResourceUpdate,
                    Some(resource),
                    Some(modified),
                )
                .await;
            }
            ResourceEvent::Deleted { resource } | ResourceEvent::Expired { resource } => {
                self.check_subscriptions(
                    cse,
                    resource.ri(),
                    NotificationEventType::ResourceDelete,
                    Some(resource),
                    None,
                )
                .await;
                self.check_subscriptions(
                    cse,
                    resource.pi(),
                    NotificationEventType::DeleteDirectChild,
                    Some(resource),
                    None,
                )
                .await;
            }
        }
    }

    async fn check_subscriptions(
        &self,
        cse: &Arc<Cse>,
        subscribed_ri: &str,
        reason: NotificationEventType,
        resource: Option<&Resource>,
        modified: Option<&Map<String, Value>>,
    ) {
        if subscribed_ri.is_empty() {
            return;
        }
        let subscriptions = match cse.storage.subscriptions_for_parent(subscribed_ri).await {
            Ok(subscriptions) => subscriptions,
            Err(err) => {
                warn!("could not load subscriptions of '{subscribed_ri}': {err}");
                return;
            }
        };
        for sub in subscriptions {
            // never notify a subscription about its own child events
            if reason.is_child_event()
                && resource.is_some_and(|child| child.ri() == sub.ri)
            {
                continue;
            }
            if !sub.net.contains(&reason.code()) {
                continue;
            }
            if reason.is_child_event() {
                if let (Some(chty), Some(child)) = (&sub.chty, resource) {
                    if !chty.contains(&(child.ty().code() as i64)) {
                        continue;
                    }
                }
            }
            if reason == NotificationEventType::ResourceUpdate {
                if let Some(atr) = &sub.atr {
                    let matched = modified
                        .is_some_and(|m| m.keys().any(|key| atr.contains(key)));
                    if !matched {
                        debug!("no matching attributes for subscription '{}'", sub.ri);
                        continue;
                    }
                }
            }
            self.handle_subscription_notification(cse, &sub, reason, resource, modified, None)
                .await;
        }
    }

    /// Missing-data entry point for time-series style reporting: fires
    /// when the collected list reaches the subscription's threshold.
    pub async fn report_missing_data(
        &self,
        cse: &Arc<Cse>,
        sub_ri: &str,
        missing: &MissingData,
    ) {
        let Ok(Some(sub)) = cse.storage.subscription(sub_ri).await else {
            return;
        };
        if !sub
            .net
            .contains(&NotificationEventType::ReportMissingData.code())
        {
            return;
        }
        if missing.list.len() < missing.number {
            return;
        }
        self.handle_subscription_notification(
            cse,
            &sub,
            NotificationEventType::ReportMissingData,
            None,
            None,
            Some(missing),
        )
        .await;
    }

    /// Build and deliver (or enqueue) one notification for a matching
    /// subscription, then maintain the expiration counter.
    async fn handle_subscription_notification(
        &self,
        cse: &Arc<Cse>,
        sub: &SubscriptionRecord,
        reason: NotificationEventType,
        resource: Option<&Resource>,
        modified: Option<&Map<String, Value>>,
        missing: Option<&MissingData>,
    ) {
        let representation = match sub.nct {
            content_type::RI => resource.map(|r| json!({ "m2m:uri": r.ri() })),
            content_type::MODIFIED_ATTRIBUTES => match (resource, modified) {
                (Some(r), Some(m)) => {
                    Some(json!({ (r.type_prefix()): Value::Object(m.clone()) }))
                }
                _ => None,
            },
            content_type::TIME_SERIES => missing.map(|m| json!({ "m2m:tsn": m.to_wire() })),
            _ => resource.map(Resource::to_wire),
        };

        let mut nev = Map::new();
        nev.insert("net".into(), json!(reason.code()));
        if let Some(rep) = representation {
            nev.insert("rep".into(), rep);
        }
        let request = json!({
            "m2m:sgn": { "nev": Value::Object(nev), "sur": full_ri(cse, &sub.ri) }
        });

        let mut all_delivered = true;
        for nu in &sub.nus {
            let delivered = if sub.has_batching() {
                self.store_batch_notification(cse, sub, nu, &request).await
            } else {
                self.send_with_retry(cse, nu, request.clone(), None).await
            };
            if !delivered {
                debug!("notification to '{nu}' failed for subscription '{}'", sub.ri);
                all_delivered = false;
                break;
            }
        }

        if all_delivered {
            self.decrement_expiration_counter(cse, sub).await;
        }
    }

    async fn decrement_expiration_counter(&self, cse: &Arc<Cse>, sub: &SubscriptionRecord) {
        let Some(exc) = sub.exc else { return };
        let remaining = exc.saturating_sub(1);
        debug!("expirationCounter of '{}': {exc} -> {remaining}", sub.ri);
        if remaining == 0 {
            info!("expirationCounter expired, removing subscription '{}'", sub.ri);
            if let Err(err) = cse
                .delete_resource_tree(&sub.ri, &cse.config.originator, DeleteCause::Request)
                .await
            {
                warn!("could not remove exhausted subscription '{}': {err}", sub.ri);
            }
            return;
        }
        let mut record = sub.clone();
        record.exc = Some(remaining);
        let _ = cse.storage.update_subscription(record).await;
        if let Ok(Some(mut resource)) = cse.storage.resource_by_ri(&sub.ri).await {
            if resource.ty() == ResourceType::Sub {
                resource.set_attr("exc", json!(remaining));
                let _ = cse.storage.update_resource(&resource).await;
            }
        }
    }

    /// Queue a notification for batched delivery to `nu`. Drains when
    /// `bn/num` is reached; otherwise arms the `bn/dur` timer.
    async fn store_batch_notification(
        &self,
        cse: &Arc<Cse>,
        sub: &SubscriptionRecord,
        nu: &str,
        request: &Value,
    ) -> bool {
        let sgn = request.get("m2m:sgn").cloned().unwrap_or(Value::Null);
        if cse
            .storage
            .add_batch_notification(&sub.ri, nu, sgn, Utc::now())
            .await
            .is_err()
        {
            return false;
        }

        let count = cse
            .storage
            .count_batch_notifications(&sub.ri, nu)
            .await
            .unwrap_or(0);
        if sub.bn_num.is_some_and(|num| count as u64 >= num) {
            self.stop_batch_worker(&sub.ri, nu).await;
            return self.send_aggregated_batch(cse, &sub.ri, nu, sub.ln).await;
        }

        if let Some(dur) = sub.bn_dur {
            self.start_batch_worker(cse, sub, nu, dur).await;
        }
        true
    }

    /// Drain and send the stored batch for one `(subscription, target)`
    /// pair, oldest first. With `ln` only the newest entry is sent,
    /// carrying the `latest` event category.
    pub async fn send_aggregated_batch(
        &self,
        cse: &Cse,
        sub_ri: &str,
        nu: &str,
        latest_only: bool,
    ) -> bool {
        let _guard = self.drain_lock.lock().await;
        let records = match cse.storage.batch_notifications(sub_ri, nu).await {
            Ok(records) => records,
            Err(_) => return false,
        };
        if records.is_empty() {
            return false;
        }
        let mut notifications: Vec<Value> =
            records.into_iter().map(|record| record.request).collect();
        let mut ec = None;
        if latest_only {
            notifications = notifications.split_off(notifications.len() - 1);
            ec = Some(EVENT_CATEGORY_LATEST.to_string());
        }
        debug!(
            "sending {} aggregated notifications for '{sub_ri}' to '{nu}'",
            notifications.len()
        );
        let request = json!({ "m2m:agn": { "m2m:sgn": notifications } });
        if cse.requests.send_notify(cse, nu, request, ec).await.is_err() {
            warn!("error sending aggregated batch notifications to '{nu}'");
            return false;
        }
        let _ = cse.storage.remove_batch_notifications(sub_ri, nu).await;
        true
    }

    /// Send outstanding batches of a subscription and cancel its timers.
    pub async fn flush_batch_notifications(&self, cse: &Cse, sub: &SubscriptionRecord) {
        for nu in &sub.nus {
            self.stop_batch_worker(&sub.ri, nu).await;
            self.send_aggregated_batch(cse, &sub.ri, nu, sub.ln).await;
        }
    }

    async fn start_batch_worker(
        &self,
        cse: &Arc<Cse>,
        sub: &SubscriptionRecord,
        nu: &str,
        dur: std::time::Duration,
    ) {
        let key = worker_key(&sub.ri, nu);
        let mut workers = self.batch_workers.lock().await;
        if workers.get(&key).is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        debug!("starting batch worker '{key}' ({dur:?})");
        let cse = Arc::clone(cse);
        let sub_ri = sub.ri.clone();
        let nu = nu.to_string();
        let ln = sub.ln;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(dur).await;
            cse.notification
                .send_aggregated_batch(&cse, &sub_ri, &nu, ln)
                .await;
        });
        workers.insert(key, handle);
    }

    async fn stop_batch_worker(&self, sub_ri: &str, nu: &str) {
        let mut workers = self.batch_workers.lock().await;
        if let Some(handle) = workers.remove(&worker_key(sub_ri, nu)) {
            handle.abort();
        }
    }

    /// Cancel every pending batch timer (shutdown path).
    pub async fn cancel_batch_workers(&self) {
        let mut workers = self.batch_workers.lock().await;
        for (_, handle) in workers.drain() {
            handle.abort();
        }
    }

    /// Established-subscription delivery: bounded retries with doubling
    /// backoff, then the notification is dropped.
    async fn send_with_retry(
        &self,
        cse: &Cse,
        target: &str,
        request: Value,
        ec: Option<String>,
    ) -> bool {
        let mut backoff =
            std::time::Duration::from_millis(cse.config.notification_retry_backoff_ms.max(1));
        let attempts = cse.config.notification_retries + 1;
        for attempt in 1..=attempts {
            match cse
                .requests
                .send_notify(cse, target, request.clone(), ec.clone())
                .await
            {
                Ok(_) => return true,
                Err(err) => {
                    debug!("notification attempt {attempt}/{attempts} to '{target}' failed: {err}");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                        backoff *= 2;
                    }
                }
            }
        }
        warn!("dropping notification to '{target}' after {attempts} attempts");
        false
    }
}

fn worker_key(sub_ri: &str, nu: &str) -> String {
    format!("{sub_ri};{nu}")
}

fn full_ri(cse: &Cse, ri: &str) -> String {
    format!("{}/{ri}", cse.config.csi)
}
