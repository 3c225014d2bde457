//! Task-local routing context and the scoped wrappers built on it
//!
//! Every tokio task gets its own [`RoutingContext`], created by the first
//! wrapper entered on that task. Frames opened in one task are invisible to
//! every other task, including tasks it spawns.
//!
//! A wrapper never edits the context it was entered from. It runs its body
//! under a copy carrying the new intent or override, so frames of futures
//! polled side by side in one task (`tokio::join!`, `select!`) cannot see or
//! undo each other. The last routed target and open transactions are kept
//! per task and shared by all of its frames.
//!
//! ```no_run
//! use replica_router::scope;
//!
//! # async fn example() {
//! scope::read(async {
//!     // reads here may be served by the primary replica
//!     scope::with_replica("audit", async {
//!         // reads here go to the "audit" replica
//!     })
//!     .await;
//! })
//! .await;
//! # }
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::context::{Intent, RouteTarget, RoutingContext};

tokio::task_local! {
   static ROUTING: TaskRouting;
}

/// The context of the innermost frame plus the state shared by every frame
/// of the task
#[derive(Clone, Default)]
struct TaskRouting {
   ctx: RoutingContext,
   shared: Arc<TaskShared>,
}

#[derive(Default)]
struct TaskShared {
   last_routed: Mutex<Option<RouteTarget>>,
   transactions: Mutex<HashMap<String, usize>>,
}

/// Run `body` with a routing context for this task, creating one if needed.
///
/// Diagnostics such as [`last_routed_target`] and transaction pins live as
/// long as the outermost scope, so callers wrap a whole unit of work in one.
pub async fn scope<F: Future>(body: F) -> F::Output {
   if ROUTING.try_with(|_| ()).is_ok() {
      body.await
   } else {
      ROUTING.scope(TaskRouting::default(), body).await
   }
}

/// Run `body` as a read: it may be served by a replica.
pub async fn read<F: Future>(body: F) -> F::Output {
   with_intent(Intent::Read, body).await
}

/// Run `body` as a reload: it is always served by the master.
pub async fn reload<F: Future>(body: F) -> F::Output {
   with_intent(Intent::Reload, body).await
}

/// Run `body` pinned to the master.
pub async fn on_master<F: Future>(body: F) -> F::Output {
   with_intent(Intent::ForcedMaster, body).await
}

/// Run `body` as a read unless an enclosing frame already decided the intent.
///
/// This is how query entry points frame themselves: a lookup issued inside a
/// [`reload`] or [`on_master`] block stays on the master.
pub async fn as_read<F: Future>(body: F) -> F::Output {
   if current_intent() == Intent::None {
      read(body).await
   } else {
      scope(body).await
   }
}

/// Run `body` with reads routed to the replica named `replica`.
///
/// Nested calls stack: the most recently entered name wins until its block
/// exits. If `replica` is not configured for a master, reads fall back to
/// that master.
pub async fn with_replica<F: Future>(replica: impl Into<String>, body: F) -> F::Output {
   let replica = replica.into();
   derived(|ctx| ctx.push_replica(&replica), body).await
}

/// Keep every operation this task routes to the master `identity` on the
/// master until the returned pin is dropped.
///
/// Returns `None` outside any [`scope`]: there is no task context to pin.
pub fn pin_master(identity: impl Into<String>) -> Option<MasterPin> {
   let identity = identity.into();
   ROUTING
      .try_with(|routing| {
         *routing
            .shared
            .transactions
            .lock()
            .entry(identity.clone())
            .or_default() += 1;
         MasterPin {
            shared: Arc::clone(&routing.shared),
            identity,
         }
      })
      .ok()
}

/// Whether this task holds a [`MasterPin`] for the master `identity`
pub fn is_master_pinned(identity: &str) -> bool {
   ROUTING
      .try_with(|routing| {
         routing.ctx.in_transaction(identity)
            || routing
               .shared
               .transactions
               .lock()
               .get(identity)
               .is_some_and(|open| *open > 0)
      })
      .unwrap_or(false)
}

/// Intent of the innermost frame on this task
pub fn current_intent() -> Intent {
   ROUTING
      .try_with(|routing| routing.ctx.intent())
      .unwrap_or_default()
}

/// The replica override currently in effect on this task
pub fn active_replica() -> Option<String> {
   ROUTING
      .try_with(|routing| routing.ctx.active_replica().map(str::to_string))
      .ok()
      .flatten()
}

/// The target of this task's most recent routing decision
pub fn last_routed_target() -> Option<RouteTarget> {
   ROUTING
      .try_with(|routing| routing.shared.last_routed.lock().clone())
      .ok()
      .flatten()
}

/// Snapshot of the decision inputs: intent and active override
pub(crate) fn snapshot() -> (Intent, Option<String>) {
   ROUTING
      .try_with(|routing| {
         (
            routing.ctx.intent(),
            routing.ctx.active_replica().map(str::to_string),
         )
      })
      .unwrap_or_default()
}

/// Record a decision; a no-op outside any scope
pub(crate) fn record(target: RouteTarget) {
   let _ = ROUTING.try_with(|routing| *routing.shared.last_routed.lock() = Some(target));
}

/// Marks one open transaction on a master for the task that created it
///
/// Dropping it ends the pin. It may be moved to and dropped on another task.
#[must_use = "the pin ends as soon as it is dropped"]
pub struct MasterPin {
   shared: Arc<TaskShared>,
   identity: String,
}

impl MasterPin {
   pub fn identity(&self) -> &str {
      &self.identity
   }
}

impl Drop for MasterPin {
   fn drop(&mut self) {
      let mut transactions = self.shared.transactions.lock();
      if let Some(open) = transactions.get_mut(&self.identity) {
         *open -= 1;
         if *open == 0 {
            transactions.remove(&self.identity);
         }
      }
   }
}

impl std::fmt::Debug for MasterPin {
   fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
      f.debug_struct("MasterPin")
         .field("identity", &self.identity)
         .finish()
   }
}

async fn with_intent<F: Future>(intent: Intent, body: F) -> F::Output {
   derived(
      |ctx| {
         ctx.replace_intent(intent);
      },
      body,
   )
   .await
}

/// Run `body` under a copy of the current context changed by `change`.
async fn derived<F: Future>(change: impl FnOnce(&mut RoutingContext), body: F) -> F::Output {
   let mut routing = ROUTING.try_with(TaskRouting::clone).unwrap_or_default();
   change(&mut routing.ctx);
   ROUTING.scope(routing, body).await
}
