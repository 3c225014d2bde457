//! Routing intent for one execution context

use std::collections::HashMap;
use std::fmt;
use std::ops::{Deref, DerefMut};

use tracing::error;

/// What the current operation wants from the router
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Intent {
   /// No read framing: the operation goes to the master
   #[default]
   None,
   /// A read that may be served by a replica
   Read,
   /// Reloading objects from authoritative state
   Reload,
   /// Explicitly pinned to the master
   ForcedMaster,
}

/// Where an operation was routed
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RouteTarget {
   Master,
   Replica(String),
}

impl RouteTarget {
   pub fn is_master(&self) -> bool {
      matches!(self, RouteTarget::Master)
   }

   /// Name of the replica, if routed to one
   pub fn replica_name(&self) -> Option<&str> {
      match self {
         RouteTarget::Master => None,
         RouteTarget::Replica(name) => Some(name),
      }
   }
}

impl fmt::Display for RouteTarget {
   fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
      match self {
         RouteTarget::Master => f.write_str("master"),
         RouteTarget::Replica(name) => write!(f, "replica '{name}'"),
      }
   }
}

#[derive(Debug, Clone)]
struct ReplicaOverride {
   name: String,
   active: usize,
}

/// Routing state owned by a single execution context
///
/// A context is never shared: each task gets its own (see [`crate::scope`]),
/// or the caller owns one and passes it by reference to
/// [`ReplicaRouter::route`](crate::ReplicaRouter::route).
///
/// Intent, replica overrides and transaction pins are changed through
/// guards. Each guard mutably borrows the context and derefs to it, so frames
/// nest strictly and are restored on every exit path, including unwinding.
///
/// ```
/// use replica_router::{Intent, RoutingContext};
///
/// let mut ctx = RoutingContext::new();
/// {
///     let mut read = ctx.begin_read();
///     assert_eq!(read.intent(), Intent::Read);
///
///     let audit = read.enter_replica("audit");
///     assert_eq!(audit.active_replica(), Some("audit"));
/// }
/// assert_eq!(ctx.intent(), Intent::None);
/// assert_eq!(ctx.active_replica(), None);
/// ```
#[derive(Debug, Default, Clone)]
pub struct RoutingContext {
   intent: Intent,
   overrides: Vec<ReplicaOverride>,
   /// Open transactions per master identity
   transactions: HashMap<String, usize>,
   last_routed: Option<RouteTarget>,
}

impl RoutingContext {
   pub fn new() -> Self {
      Self::default()
   }

   /// The intent of the innermost open frame
   pub fn intent(&self) -> Intent {
      self.intent
   }

   /// The most recently entered replica override that is still active
   pub fn active_replica(&self) -> Option<&str> {
      self
         .overrides
         .iter()
         .rev()
         .find(|o| o.active > 0)
         .map(|o| o.name.as_str())
   }

   /// How many open `with_replica` frames name `replica`
   pub fn replica_depth(&self, replica: &str) -> usize {
      self
         .overrides
         .iter()
         .filter(|o| o.name == replica)
         .map(|o| o.active)
         .sum()
   }

   /// Whether this context has a transaction open on the master `identity`
   pub fn in_transaction(&self, identity: &str) -> bool {
      self.transactions.get(identity).is_some_and(|open| *open > 0)
   }

   /// The target chosen by the most recent routing decision
   ///
   /// For diagnostics only; routing never consults it.
   pub fn last_routed_target(&self) -> Option<&RouteTarget> {
      self.last_routed.as_ref()
   }

   /// Frame the enclosed operations as reads
   pub fn begin_read(&mut self) -> IntentGuard<'_> {
      IntentGuard::new(self, Intent::Read)
   }

   /// Frame the enclosed operations as reloads
   pub fn begin_reload(&mut self) -> IntentGuard<'_> {
      IntentGuard::new(self, Intent::Reload)
   }

   /// Pin the enclosed operations to the master
   pub fn begin_forced_master(&mut self) -> IntentGuard<'_> {
      IntentGuard::new(self, Intent::ForcedMaster)
   }

   /// Route enclosed reads to `replica` until the guard is dropped
   pub fn enter_replica(&mut self, replica: impl Into<String>) -> ReplicaGuard<'_> {
      let replica = replica.into();
      self.push_replica(&replica);
      ReplicaGuard { ctx: self, replica }
   }

   /// Keep every operation on the master `identity` until the guard is dropped
   pub fn begin_transaction(&mut self, identity: impl Into<String>) -> TransactionGuard<'_> {
      let identity = identity.into();
      *self.transactions.entry(identity.clone()).or_default() += 1;
      TransactionGuard { ctx: self, identity }
   }

   /// Run `body` with reads routed to `replica`
   pub fn with_replica<T>(
      &mut self,
      replica: impl Into<String>,
      body: impl FnOnce(&mut RoutingContext) -> T,
   ) -> T {
      let mut guard = self.enter_replica(replica);
      body(&mut guard)
   }

   pub(crate) fn replace_intent(&mut self, intent: Intent) -> Intent {
      std::mem::replace(&mut self.intent, intent)
   }

   pub(crate) fn record(&mut self, target: RouteTarget) {
      self.last_routed = Some(target);
   }

   pub(crate) fn push_replica(&mut self, replica: &str) {
      match self.overrides.last_mut() {
         Some(top) if top.name == replica => top.active += 1,
         _ => self.overrides.push(ReplicaOverride {
            name: replica.to_string(),
            active: 1,
         }),
      }
   }

   /// Release the innermost override, which must be `replica`.
   ///
   /// Guards nest strictly, so a mismatch means the routing state is corrupt
   /// and cannot be trusted for any further decision.
   pub(crate) fn pop_replica(&mut self, replica: &str) {
      match self.overrides.last_mut() {
         Some(top) if top.name == replica => {
            top.active -= 1;
            if top.active == 0 {
               self.overrides.pop();
            }
         }
         top => {
            let innermost = top.map(|o| o.name.clone());
            error!(replica = %replica, innermost = ?innermost, "Unbalanced replica override release");
            panic!("replica override '{replica}' released out of order or more often than entered");
         }
      }
   }

   fn end_transaction(&mut self, identity: &str) {
      if let Some(open) = self.transactions.get_mut(identity) {
         *open -= 1;
         if *open == 0 {
            self.transactions.remove(identity);
         }
      }
   }
}

/// Restores the previous intent when dropped
#[must_use = "the intent is restored as soon as the guard is dropped"]
#[derive(Debug)]
pub struct IntentGuard<'a> {
   ctx: &'a mut RoutingContext,
   previous: Intent,
}

impl<'a> IntentGuard<'a> {
   fn new(ctx: &'a mut RoutingContext, intent: Intent) -> Self {
      let previous = ctx.replace_intent(intent);
      Self { ctx, previous }
   }
}

impl Deref for IntentGuard<'_> {
   type Target = RoutingContext;

   fn deref(&self) -> &Self::Target {
      self.ctx
   }
}

impl DerefMut for IntentGuard<'_> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.ctx
   }
}

impl Drop for IntentGuard<'_> {
   fn drop(&mut self) {
      self.ctx.replace_intent(self.previous);
   }
}

/// Releases a replica override when dropped
#[must_use = "the override ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct ReplicaGuard<'a> {
   ctx: &'a mut RoutingContext,
   replica: String,
}

impl ReplicaGuard<'_> {
   /// The replica this guard selected
   pub fn replica(&self) -> &str {
      &self.replica
   }
}

impl Deref for ReplicaGuard<'_> {
   type Target = RoutingContext;

   fn deref(&self) -> &Self::Target {
      self.ctx
   }
}

impl DerefMut for ReplicaGuard<'_> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.ctx
   }
}

impl Drop for ReplicaGuard<'_> {
   fn drop(&mut self) {
      self.ctx.pop_replica(&self.replica);
   }
}

/// Ends a transaction pin when dropped
#[must_use = "the pin ends as soon as the guard is dropped"]
#[derive(Debug)]
pub struct TransactionGuard<'a> {
   ctx: &'a mut RoutingContext,
   identity: String,
}

impl Deref for TransactionGuard<'_> {
   type Target = RoutingContext;

   fn deref(&self) -> &Self::Target {
      self.ctx
   }
}

impl DerefMut for TransactionGuard<'_> {
   fn deref_mut(&mut self) -> &mut Self::Target {
      self.ctx
   }
}

impl Drop for TransactionGuard<'_> {
   fn drop(&mut self) {
      self.ctx.end_transaction(&self.identity);
   }
}
