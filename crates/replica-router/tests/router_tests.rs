//! Routing behavior against an in-memory connection provider.
//!
//! Tests verify:
//! - Precedence: transactions, forced master, reload, named override, primary replica
//! - Fallback: missing replicas route to the master without errors
//! - Isolation: overrides and transaction pins in one task never affect
//!   another, and joined frames on one task never affect each other
//! - Handle lifecycle: lazy, shared, replaced by re-establishing

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use replica_router::{
   Configurations, ConnectionProvider, ConnectionSpec, Error, ReplicaRouter, RouteTarget,
   RouterConfig, RoutingContext, scope,
};
use tokio::sync::Barrier;

#[derive(Debug)]
struct MockConnection {
   id: usize,
   spec: ConnectionSpec,
   open_transactions: AtomicUsize,
}

#[derive(Default)]
struct MockProvider {
   configurations: Configurations,
   masters: std::sync::Mutex<HashMap<String, Arc<MockConnection>>>,
   next_id: AtomicUsize,
   established: AtomicUsize,
   released: AtomicUsize,
   establish_delay: Option<Duration>,
}

impl MockProvider {
   fn new(configurations: Configurations) -> Self {
      Self {
         configurations,
         ..Default::default()
      }
   }

   fn connection(&self, spec: &ConnectionSpec) -> Arc<MockConnection> {
      Arc::new(MockConnection {
         id: self.next_id.fetch_add(1, Ordering::SeqCst),
         spec: spec.clone(),
         open_transactions: AtomicUsize::new(0),
      })
   }
}

impl ConnectionProvider for MockProvider {
   type Connection = MockConnection;

   async fn acquire_master(&self, name: &str) -> replica_router::Result<Arc<MockConnection>> {
      if name == "unreachable" {
         return Err(Error::acquisition(std::io::Error::new(
            std::io::ErrorKind::ConnectionRefused,
            "connection refused",
         )));
      }

      let spec = self
         .configurations
         .lookup(name)
         .ok_or_else(|| Error::UnknownDatabase(name.to_string()))?;

      let mut masters = self.masters.lock().unwrap();
      let master = masters
         .entry(name.to_string())
         .or_insert_with(|| self.connection(spec));
      Ok(Arc::clone(master))
   }

   fn lookup_configuration(&self, name: &str) -> Option<&ConnectionSpec> {
      self.configurations.lookup(name)
   }

   fn connection_spec<'a>(&self, connection: &'a MockConnection) -> &'a ConnectionSpec {
      &connection.spec
   }

   fn open_transactions(&self, connection: &MockConnection) -> usize {
      connection.open_transactions.load(Ordering::SeqCst)
   }

   async fn establish(&self, spec: &ConnectionSpec) -> replica_router::Result<Arc<MockConnection>> {
      if let Some(delay) = self.establish_delay {
         tokio::time::sleep(delay).await;
      }

      if spec.database == "offline.db" {
         return Err(Error::acquisition(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            "replica offline",
         )));
      }

      self.established.fetch_add(1, Ordering::SeqCst);
      Ok(self.connection(spec))
   }

   async fn release(&self, connection: Arc<MockConnection>) {
      self.released.fetch_add(1, Ordering::SeqCst);
      drop(connection);
   }
}

/// Master "orders" with replicas reports (primary) and audit
fn orders_configurations() -> Configurations {
   Configurations::new()
      .with(
         "orders",
         ConnectionSpec::new("orders.db")
            .with_replica("reports", "cfg_r")
            .with_replica("audit", "cfg_a")
            .with_primary_replica("reports"),
      )
      .with("cfg_r", ConnectionSpec::new("orders-reports.db"))
      .with("cfg_a", ConnectionSpec::new("orders-audit.db"))
}

fn orders_router() -> ReplicaRouter<MockProvider> {
   ReplicaRouter::new(MockProvider::new(orders_configurations()))
}

fn replica(name: &str) -> RouteTarget {
   RouteTarget::Replica(name.to_string())
}

async fn routed_to(router: &ReplicaRouter<MockProvider>) -> RouteTarget {
   router.connection("orders").await.unwrap().target().clone()
}

// ============================================================================
// Precedence
// ============================================================================

#[tokio::test]
async fn test_orders_scenario() {
   let router = orders_router();

   scope::scope(async {
      // write
      assert_eq!(routed_to(&router).await, RouteTarget::Master);
      assert_eq!(scope::last_routed_target(), Some(RouteTarget::Master));

      // read
      assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));
      assert_eq!(scope::last_routed_target(), Some(replica("reports")));

      assert_eq!(
         scope::with_replica("audit", scope::read(routed_to(&router))).await,
         replica("audit")
      );
      assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));

      router.set_all_reads_on_replica(false);
      assert_eq!(scope::read(routed_to(&router)).await, RouteTarget::Master);
      assert_eq!(
         scope::with_replica("audit", scope::read(routed_to(&router))).await,
         replica("audit")
      );
   })
   .await;
}

#[tokio::test]
async fn test_config_can_disable_default_replica_reads() {
   let router = ReplicaRouter::with_config(
      MockProvider::new(orders_configurations()),
      RouterConfig {
         all_reads_on_replica: false,
      },
   );

   assert!(!router.all_reads_on_replica());
   assert_eq!(scope::read(routed_to(&router)).await, RouteTarget::Master);

   router.set_all_reads_on_replica(true);
   assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));
}

#[tokio::test]
async fn test_nested_overrides_revert_to_outer() {
   let router = orders_router();

   scope::read(scope::with_replica("reports", async {
      assert_eq!(routed_to(&router).await, replica("reports"));

      scope::with_replica("audit", async {
         assert_eq!(routed_to(&router).await, replica("audit"));
      })
      .await;

      assert_eq!(routed_to(&router).await, replica("reports"));
   }))
   .await;
}

#[tokio::test]
async fn test_reload_always_uses_master() {
   let router = orders_router();

   let target = scope::read(scope::with_replica(
      "audit",
      scope::reload(routed_to(&router)),
   ))
   .await;
   assert_eq!(target, RouteTarget::Master);

   // The read frame is back in effect after the reload
   let target = scope::read(async {
      scope::reload(routed_to(&router)).await;
      routed_to(&router).await
   })
   .await;
   assert_eq!(target, replica("reports"));
}

#[tokio::test]
async fn test_forced_master_overrides_replica() {
   let router = orders_router();

   let target = scope::with_replica("audit", scope::on_master(routed_to(&router))).await;
   assert_eq!(target, RouteTarget::Master);
}

#[tokio::test]
async fn test_provider_reported_transaction_pins_to_master() {
   let router = orders_router();
   let master = router.connection("orders").await.unwrap();
   master.open_transactions.store(1, Ordering::SeqCst);

   assert_eq!(scope::read(routed_to(&router)).await, RouteTarget::Master);
   assert_eq!(
      scope::with_replica("audit", scope::read(routed_to(&router))).await,
      RouteTarget::Master
   );

   master.open_transactions.store(0, Ordering::SeqCst);
   assert_eq!(
      scope::with_replica("audit", scope::read(routed_to(&router))).await,
      replica("audit")
   );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_master_pin_stays_on_its_task() {
   let router = Arc::new(orders_router());

   scope::scope(async {
      let pin = scope::pin_master("orders.db").unwrap();
      assert_eq!(scope::read(routed_to(&router)).await, RouteTarget::Master);
      assert_eq!(
         scope::with_replica("audit", scope::read(routed_to(&router))).await,
         RouteTarget::Master
      );

      let other_task = {
         let router = Arc::clone(&router);
         tokio::spawn(scope::read(async move { routed_to(&router).await }))
      };
      assert_eq!(other_task.await.unwrap(), replica("reports"));

      drop(pin);
      assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));
   })
   .await;
}

#[tokio::test]
async fn test_master_pin_held_inside_joined_frame() {
   let router = orders_router();

   scope::scope(async {
      let pinned = scope::read(async {
         let _pin = scope::pin_master("orders.db").unwrap();
         tokio::task::yield_now().await;
         routed_to(&router).await
      });
      let (pinned, _) = tokio::join!(pinned, tokio::task::yield_now());
      assert_eq!(pinned, RouteTarget::Master);

      assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));
   })
   .await;
}

#[tokio::test]
async fn test_without_read_framing_uses_master() {
   let router = orders_router();

   assert_eq!(routed_to(&router).await, RouteTarget::Master);
   // An override alone is not a read
   assert_eq!(
      scope::with_replica("audit", routed_to(&router)).await,
      RouteTarget::Master
   );
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_unknown_replica_falls_back_to_master() {
   let router = orders_router();

   let routed = scope::with_replica("nightly", scope::read(router.connection("orders")))
      .await
      .expect("missing replica must not be an error");

   assert!(routed.is_master());
   assert_eq!(router.provider().established.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_master_without_replicas_serves_reads() {
   let configurations = Configurations::new().with("solo", ConnectionSpec::new("solo.db"));
   let router = ReplicaRouter::new(MockProvider::new(configurations));

   let read = scope::read(router.connection("solo")).await.unwrap();
   let reload = scope::reload(router.connection("solo")).await.unwrap();
   let master = router.connection("solo").await.unwrap();

   assert!(read.is_master() && reload.is_master());
   assert_eq!(read.id, master.id);
   assert_eq!(router.replica_connection("solo").await.unwrap().id, master.id);
}

#[tokio::test]
async fn test_implicit_replica_convention() {
   let configurations = Configurations::new()
      .with("main", ConnectionSpec::new("test_db"))
      .with("slave_for_test_db", ConnectionSpec::new("test_db_replica"));
   let router = ReplicaRouter::new(MockProvider::new(configurations));

   let routed = scope::read(router.connection("main")).await.unwrap();
   assert_eq!(routed.target(), &replica("default"));
   assert_eq!(routed.spec.database, "test_db_replica");
   assert_eq!(router.master_identity("main").await.unwrap(), "test_db");
}

#[tokio::test]
async fn test_replicas_listed_under_slaves_key() {
   let configurations = Configurations::from_json_str(
      r#"{
         "rfs": { "database": "test_db", "slaves": { "slave_2": "slave_2_for_test_db" } },
         "slave_for_test_db": { "database": "test_db_replica" },
         "slave_2_for_test_db": { "database": "test_db_replica_2" }
      }"#,
   )
   .unwrap();
   let router = ReplicaRouter::new(MockProvider::new(configurations));

   let routed = scope::with_replica("slave_2", scope::read(router.connection("rfs")))
      .await
      .unwrap();
   assert_eq!(routed.target(), &replica("slave_2"));
   assert_eq!(routed.spec.database, "test_db_replica_2");

   let routed = scope::read(router.connection("rfs")).await.unwrap();
   assert_eq!(routed.target(), &replica("default"));
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_master_failures_propagate() {
   let router = orders_router();

   let err = scope::read(router.connection("unreachable")).await.unwrap_err();
   assert!(matches!(err, Error::ConnectionAcquisition(_)));

   let err = router.connection("inventory").await.unwrap_err();
   assert!(matches!(err, Error::UnknownDatabase(name) if name == "inventory"));
}

#[tokio::test]
async fn test_replica_establish_failure_propagates() {
   let configurations = Configurations::new()
      .with(
         "main",
         ConnectionSpec::new("main.db").with_replica("cold", "cfg_cold"),
      )
      .with("cfg_cold", ConnectionSpec::new("offline.db"));
   let router = ReplicaRouter::new(MockProvider::new(configurations));

   let err = scope::read(router.connection("main")).await.unwrap_err();
   assert_eq!(err.error_code(), "CONNECTION_ACQUISITION_FAILED");
}

// ============================================================================
// Isolation
// ============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_overrides_do_not_leak_between_tasks() {
   let router = Arc::new(orders_router());
   let barrier = Arc::new(Barrier::new(2));

   let overriding = {
      let (router, barrier) = (Arc::clone(&router), Arc::clone(&barrier));
      tokio::spawn(scope::read(scope::with_replica("audit", async move {
         barrier.wait().await;
         let target = routed_to(&router).await;
         barrier.wait().await;
         target
      })))
   };

   let plain = {
      let (router, barrier) = (Arc::clone(&router), Arc::clone(&barrier));
      tokio::spawn(async move {
         barrier.wait().await;
         let read = scope::read(routed_to(&router)).await;
         let write = routed_to(&router).await;
         barrier.wait().await;
         (read, write)
      })
   };

   assert_eq!(overriding.await.unwrap(), replica("audit"));
   assert_eq!(
      plain.await.unwrap(),
      (replica("reports"), RouteTarget::Master)
   );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_forced_master_does_not_leak_between_tasks() {
   let router = Arc::new(orders_router());
   let barrier = Arc::new(Barrier::new(2));

   let pinned = {
      let (router, barrier) = (Arc::clone(&router), Arc::clone(&barrier));
      tokio::spawn(scope::on_master(async move {
         barrier.wait().await;
         routed_to(&router).await
      }))
   };

   let reader = {
      let (router, barrier) = (Arc::clone(&router), Arc::clone(&barrier));
      tokio::spawn(scope::read(async move {
         barrier.wait().await;
         routed_to(&router).await
      }))
   };

   assert_eq!(pinned.await.unwrap(), RouteTarget::Master);
   assert_eq!(reader.await.unwrap(), replica("reports"));
}

#[tokio::test]
async fn test_joined_frames_route_independently() {
   let router = orders_router();

   scope::scope(async {
      let reader = scope::read(async {
         tokio::task::yield_now().await;
         let first = routed_to(&router).await;
         tokio::task::yield_now().await;
         (first, routed_to(&router).await)
      });
      let writer = scope::on_master(async {
         tokio::task::yield_now().await;
         tokio::task::yield_now().await;
         routed_to(&router).await
      });
      let audit = scope::with_replica("audit", scope::read(async {
         tokio::task::yield_now().await;
         routed_to(&router).await
      }));

      let (reader, writer, audit) = tokio::join!(reader, writer, audit);
      assert_eq!(reader, (replica("reports"), replica("reports")));
      assert_eq!(writer, RouteTarget::Master);
      assert_eq!(audit, replica("audit"));

      // Nothing leaks out of the joined frames
      assert_eq!(routed_to(&router).await, RouteTarget::Master);
      assert_eq!(scope::active_replica(), None);
   })
   .await;
}

// ============================================================================
// Explicit context
// ============================================================================

#[tokio::test]
async fn test_explicit_context_routing() {
   let router = orders_router();
   let mut ctx = RoutingContext::new();

   let routed = router.route("orders", &mut ctx).await.unwrap();
   assert!(routed.is_master());

   {
      let mut read = ctx.begin_read();
      assert_eq!(
         router.route("orders", &mut read).await.unwrap().target(),
         &replica("reports")
      );

      let mut audit = read.enter_replica("audit");
      assert_eq!(
         router.route("orders", &mut audit).await.unwrap().target(),
         &replica("audit")
      );
      assert_eq!(audit.last_routed_target(), Some(&replica("audit")));
   }

   assert_eq!(ctx.active_replica(), None);
   assert_eq!(ctx.last_routed_target(), Some(&replica("audit")));
}

#[tokio::test]
async fn test_explicit_context_transaction_pin() {
   let router = orders_router();
   let mut ctx = RoutingContext::new();
   let mut read = ctx.begin_read();

   {
      let mut tx = read.begin_transaction("orders.db");
      assert!(router.route("orders", &mut tx).await.unwrap().is_master());

      let mut audit = tx.enter_replica("audit");
      assert!(router.route("orders", &mut audit).await.unwrap().is_master());
   }

   assert!(!read.in_transaction("orders.db"));
   assert_eq!(
      router.route("orders", &mut read).await.unwrap().target(),
      &replica("reports")
   );

   // Pins made through a context are not seen by the task-local scope
   let mut other = RoutingContext::new();
   let _tx = other.begin_transaction("orders.db");
   assert_eq!(scope::read(routed_to(&router)).await, replica("reports"));
}

// ============================================================================
// Handle lifecycle
// ============================================================================

#[tokio::test]
async fn test_replica_handles_are_lazy_and_shared() {
   let router = orders_router();
   let provider = Arc::clone(router.provider());

   assert_eq!(provider.established.load(Ordering::SeqCst), 0);

   let first = scope::read(router.connection("orders")).await.unwrap();
   let second = scope::read(router.connection("orders")).await.unwrap();

   assert!(Arc::ptr_eq(first.connection(), second.connection()));
   assert_eq!(provider.established.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_establishes_once() {
   let provider = MockProvider {
      establish_delay: Some(Duration::from_millis(20)),
      ..MockProvider::new(orders_configurations())
   };
   let router = Arc::new(ReplicaRouter::new(provider));

   let handles: Vec<_> = (0..16)
      .map(|_| {
         let router = Arc::clone(&router);
         tokio::spawn(scope::read(async move {
            router.connection("orders").await.unwrap().into_inner()
         }))
      })
      .collect();

   let mut connections = Vec::new();
   for handle in handles {
      connections.push(handle.await.unwrap());
   }

   assert_eq!(router.provider().established.load(Ordering::SeqCst), 1);
   assert!(connections.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test]
async fn test_establish_replica_connections_replaces_only_replicas() {
   let router = orders_router();

   let master = router.connection("orders").await.unwrap().into_inner();
   let reports = router.replica_connection("orders").await.unwrap();

   router.establish_replica_connections().await.unwrap();

   let new_master = router.connection("orders").await.unwrap().into_inner();
   let new_reports = router.replica_connection("orders").await.unwrap();

   assert!(Arc::ptr_eq(&master, &new_master));
   assert!(!Arc::ptr_eq(&reports, &new_reports));
   assert_eq!(router.provider().released.load(Ordering::SeqCst), 1);

   // The replaced handle is still usable by whoever holds it
   assert_eq!(reports.spec.database, "orders-reports.db");

   // "audit" was never used, so it stays lazy
   let entry = router.registry().entry("orders.db").unwrap();
   assert!(entry.replica("audit").unwrap().cached().is_none());
}

#[tokio::test]
async fn test_registry_connection_reports_missing_configuration() {
   let router = orders_router();
   scope::read(router.connection("orders")).await.unwrap();

   let err = router
      .registry()
      .connection("orders.db", "nightly")
      .await
      .unwrap_err();
   assert!(matches!(err, Error::ConfigurationMissing { .. }));

   let err = router
      .registry()
      .connection("unresolved.db", "reports")
      .await
      .unwrap_err();
   assert_eq!(err.error_code(), "CONFIGURATION_MISSING");

   assert!(router.registry().connection("orders.db", "audit").await.is_ok());
}
