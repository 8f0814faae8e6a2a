//! Fakes shared by the orchestrator and rollback tests.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cutover_cluster::{BoxFuture, ClusterAdapter, ClusterError, ClusterResult, LocalCluster, WaitOutcome};
use cutover_core::{PortMapping, Revision, RevisionId, RevisionSpec, StepTimeouts, TrafficSplit};
use cutover_health::{CheckResult, HealthCheck, Prober};
use cutover_state::StateStore;
use cutover_traffic::{Router, TrafficBackend, TrafficController, TrafficError, TrafficResult};

use crate::gate::HealthGate;
use crate::orchestrator::Orchestrator;
use crate::rollback::RollbackCoordinator;
use crate::settings::EnvironmentSettings;

/// `LocalCluster` with a call log and injectable failures.
pub struct TestCluster {
    inner: LocalCluster,
    calls: Mutex<Vec<String>>,
    fail_register: AtomicBool,
    stuck: AtomicBool,
    fail_update: Mutex<HashSet<RevisionId>>,
}

impl TestCluster {
    fn new(inner: LocalCluster) -> Self {
        Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_register: AtomicBool::new(false),
            stuck: AtomicBool::new(false),
            fail_update: Mutex::new(HashSet::new()),
        }
    }

    pub fn inner(&self) -> &LocalCluster {
        &self.inner
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_register(&self) {
        self.fail_register.store(true, Ordering::SeqCst);
    }

    /// `wait_stable` reports `TimedOut` from now on.
    pub fn never_stable(&self) {
        self.stuck.store(true, Ordering::SeqCst);
    }

    pub fn fail_update_for(&self, revision: &RevisionId) {
        self.fail_update.lock().unwrap().insert(revision.clone());
    }

    fn log(&self, call: String) {
        self.calls.lock().unwrap().push(call);
    }
}

impl ClusterAdapter for TestCluster {
    fn current_revision<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Revision>> {
        self.log(format!("current {environment}"));
        self.inner.current_revision(environment)
    }

    fn register_revision<'a>(
        &'a self,
        environment: &'a str,
        spec: &'a RevisionSpec,
    ) -> BoxFuture<'a, ClusterResult<Revision>> {
        self.log(format!("register {}", spec.image));
        if self.fail_register.load(Ordering::SeqCst) {
            return Box::pin(async { Err(ClusterError::Registration("rejected".to_string())) });
        }
        self.inner.register_revision(environment, spec)
    }

    fn update_service<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a Revision,
    ) -> BoxFuture<'a, ClusterResult<()>> {
        self.log(format!("update {}", revision.id));
        if self.fail_update.lock().unwrap().contains(&revision.id) {
            return Box::pin(async { Err(ClusterError::ServiceUpdate("throttled".to_string())) });
        }
        self.inner.update_service(environment, revision)
    }

    fn wait_stable<'a>(
        &'a self,
        environment: &'a str,
        timeout: Duration,
    ) -> BoxFuture<'a, ClusterResult<WaitOutcome>> {
        self.log(format!("wait {environment}"));
        if self.stuck.load(Ordering::SeqCst) {
            return Box::pin(async { Ok(WaitOutcome::TimedOut) });
        }
        self.inner.wait_stable(environment, timeout)
    }

    fn list_revisions<'a>(&'a self, environment: &'a str) -> BoxFuture<'a, ClusterResult<Vec<Revision>>> {
        self.log(format!("list {environment}"));
        self.inner.list_revisions(environment)
    }
}

/// `Router` with injectable split rejections and outages.
pub struct TestTraffic {
    router: Router,
    rejected: Mutex<HashSet<RevisionId>>,
    down: AtomicBool,
}

impl TestTraffic {
    /// Splits giving `revision` any weight fail with `InvalidSplit`.
    pub fn reject_splits_to(&self, revision: &RevisionId) {
        self.rejected.lock().unwrap().insert(revision.clone());
    }

    /// Every apply fails with a backend error from now on.
    pub fn go_down(&self) {
        self.down.store(true, Ordering::SeqCst);
    }
}

impl TrafficBackend for TestTraffic {
    fn attach<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
        endpoint: &'a str,
    ) -> cutover_traffic::BoxFuture<'a, TrafficResult<()>> {
        self.router.attach(environment, revision, endpoint)
    }

    fn is_attached<'a>(
        &'a self,
        environment: &'a str,
        revision: &'a RevisionId,
    ) -> cutover_traffic::BoxFuture<'a, TrafficResult<bool>> {
        self.router.is_attached(environment, revision)
    }

    fn apply<'a>(&'a self, split: &'a TrafficSplit) -> cutover_traffic::BoxFuture<'a, TrafficResult<()>> {
        if self.down.load(Ordering::SeqCst) {
            return Box::pin(async { Err(TrafficError::Backend("listener unreachable".to_string())) });
        }
        let rejected = self
            .rejected
            .lock()
            .unwrap()
            .iter()
            .find(|r| split.weight_of(r) > 0)
            .cloned();
        if let Some(revision) = rejected {
            return Box::pin(async move {
                Err(TrafficError::InvalidSplit(format!("{revision} has no target group")))
            });
        }
        self.router.apply(split)
    }

    fn current<'a>(
        &'a self,
        environment: &'a str,
    ) -> cutover_traffic::BoxFuture<'a, TrafficResult<Option<TrafficSplit>>> {
        self.router.current(environment)
    }
}

/// Health that follows the router. A private URL
/// (`http://{revision}.internal...`) names a revision; a public URL
/// (`http://{environment}.example.com...`) reaches whichever revision the
/// router picks for that environment.
pub struct FakeHealth {
    router: Router,
    bad: Mutex<HashSet<RevisionId>>,
    bad_public: Mutex<HashSet<RevisionId>>,
}

impl FakeHealth {
    /// `revision` answers 503 everywhere.
    pub fn break_revision(&self, revision: &RevisionId) {
        self.bad.lock().unwrap().insert(revision.clone());
    }

    /// `revision` answers 503 only through the public path.
    pub fn break_public(&self, revision: &RevisionId) {
        self.bad_public.lock().unwrap().insert(revision.clone());
    }

    fn verdict(&self, revision: &RevisionId, public: bool) -> CheckResult {
        let broken = self.bad.lock().unwrap().contains(revision)
            || (public && self.bad_public.lock().unwrap().contains(revision));
        if broken {
            CheckResult::Fail("503".to_string())
        } else {
            CheckResult::Pass
        }
    }
}

impl HealthCheck for FakeHealth {
    fn check<'a>(&'a self, url: &'a str, _timeout: Duration) -> cutover_health::BoxFuture<'a, CheckResult> {
        Box::pin(async move {
            let host = url.trim_start_matches("http://");
            let label = host.split('.').next().unwrap_or_default();
            if host.contains(".example.com") {
                return match self.router.next_backend(label) {
                    Some(route) => self.verdict(&route.revision, true),
                    None => CheckResult::NoResponse("no route".to_string()),
                };
            }
            self.verdict(&RevisionId::from(label), false)
        })
    }
}

pub struct Harness {
    pub store: StateStore,
    pub cluster: Arc<TestCluster>,
    pub router: Router,
    pub health: Arc<FakeHealth>,
    pub traffic_backend: Arc<TestTraffic>,
    pub traffic: TrafficController,
    pub settings: EnvironmentSettings,
}

impl Harness {
    pub fn new() -> Self {
        let store = StateStore::open_in_memory().unwrap();
        let cluster = Arc::new(TestCluster::new(LocalCluster::new(store.clone())));
        let router = Router::new();
        let health = Arc::new(FakeHealth {
            router: router.clone(),
            bad: Mutex::new(HashSet::new()),
            bad_public: Mutex::new(HashSet::new()),
        });
        let traffic_backend = Arc::new(TestTraffic {
            router: router.clone(),
            rejected: Mutex::new(HashSet::new()),
            down: AtomicBool::new(false),
        });
        let traffic = TrafficController::new(traffic_backend.clone());
        let settings = Self::settings_for("prod");
        Self {
            store,
            cluster,
            router,
            health,
            traffic_backend,
            traffic,
            settings,
        }
    }

    pub fn settings_for(environment: &str) -> EnvironmentSettings {
        EnvironmentSettings {
            private_health_url: "http://{revision}.internal:8080/healthz".to_string(),
            public_health_url: format!("http://{environment}.example.com/healthz"),
            timeouts: StepTimeouts {
                stable: Duration::from_secs(1),
                health: Duration::from_millis(60),
                interval: Duration::from_millis(10),
                request: Duration::from_millis(10),
            },
        }
    }

    pub fn prober(&self) -> Prober {
        Prober::new(self.health.clone(), self.settings.timeouts.request)
    }

    pub fn coordinator(&self) -> RollbackCoordinator {
        RollbackCoordinator::new(
            self.store.clone(),
            self.cluster.clone(),
            self.traffic.clone(),
            HealthGate::new(self.prober()),
        )
    }

    pub fn orchestrator(&self) -> Orchestrator {
        let environments = HashMap::from([
            ("prod".to_string(), self.settings.clone()),
            ("staging".to_string(), Self::settings_for("staging")),
        ]);
        Orchestrator::new(
            self.store.clone(),
            self.cluster.clone(),
            self.traffic.clone(),
            self.prober(),
            environments,
        )
    }

    pub fn spec(image: &str) -> RevisionSpec {
        RevisionSpec {
            name: "web".to_string(),
            image: image.to_string(),
            cpu: 256,
            memory_mib: 512,
            ports: vec![PortMapping::tcp(8080)],
            logging: None,
        }
    }

    pub async fn register(&self, image: &str) -> Revision {
        self.cluster
            .inner()
            .register_revision("prod", &Self::spec(image))
            .await
            .unwrap()
    }

    /// Register `image` and make it the running, routed revision of prod
    /// without going through the orchestrator.
    pub async fn seed_serving(&self, image: &str) -> Revision {
        let revision = self.register(image).await;
        self.cluster
            .inner()
            .update_service("prod", &revision)
            .await
            .unwrap();
        self.attach_and_route(&revision.id).await;
        revision
    }

    pub async fn attach_and_route(&self, revision: &RevisionId) {
        self.traffic
            .attach("prod", revision, &self.settings.endpoint_for(revision))
            .await
            .unwrap();
        self.traffic.cut_over("prod", revision).await.unwrap();
    }

    pub async fn current_revision(&self) -> RevisionId {
        self.cluster.inner().current_revision("prod").await.unwrap().id
    }

    /// Revision taking all of prod's traffic per the router.
    pub async fn serving(&self) -> Option<RevisionId> {
        self.router
            .current("prod")
            .await
            .unwrap()
            .and_then(|s| s.serving().cloned())
    }
}
