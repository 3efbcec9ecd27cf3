use async_trait::async_trait;
use mockall::mock;
use nocache_cache_inmemory::BasicCache;
use nocache_core::{
    ClassifierConfig, ConfigStore, CoreError, NoCacheInterceptor, NodeClassRegistry,
    NodeDescriptor, NodeId, NodeOutput, OutputCache, OutputValue, Prompt, Tensor,
};
use nocache_monitoring::{MemoryReclaimer, NoopReclaimer, ReclaimSchedule, ReclaimWorker};
use nocache_runtime::{
    CachedGraphExecutor, ExecutionSummary, NoCacheRuntime, NodeRunner, NoopObserver,
    PromptExecutor, ResolvedInputs,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

mock! {
    pub Reclaimer {}

    impl MemoryReclaimer for Reclaimer {
        fn collect_garbage(&self) -> anyhow::Result<()>;
        fn release_device_memory(&self) -> anyhow::Result<()>;
    }
}

/// Emits a tensor of `mib` MiB when the node has that literal, otherwise its id
#[derive(Default)]
struct RecordingRunner {
    calls: Mutex<Vec<NodeId>>,
}

impl RecordingRunner {
    fn calls(&self) -> Vec<NodeId> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl NodeRunner for RecordingRunner {
    async fn run(
        &self,
        node: &NodeDescriptor,
        _inputs: ResolvedInputs,
    ) -> Result<NodeOutput, CoreError> {
        self.calls.lock().push(node.id.clone());
        let mib = node
            .inputs
            .get("mib")
            .and_then(|input| input.as_literal())
            .and_then(|value| value.as_u64());
        Ok(match mib {
            Some(mib) => NodeOutput::single(OutputValue::tensor(Tensor::new(
                vec![mib as usize * 1024 * 1024],
                1,
            ))),
            None => NodeOutput::single(OutputValue::Text(node.id.to_string())),
        })
    }
}

struct Harness {
    runtime: Arc<NoCacheRuntime>,
    cache: Arc<dyn OutputCache>,
    runner: Arc<RecordingRunner>,
}

impl Harness {
    fn new(runtime: NoCacheRuntime) -> Self {
        let runtime = Arc::new(runtime);
        let cache = runtime.install_cache(Arc::new(BasicCache::new()));
        Self {
            runtime,
            cache,
            runner: Arc::new(RecordingRunner::default()),
        }
    }

    async fn run(&self, prompt: &Arc<Prompt>) -> Result<ExecutionSummary, CoreError> {
        let executor = self
            .runtime
            .wrap_executor(CachedGraphExecutor::new(self.cache.clone(), self.runner.clone()));
        executor.execute(prompt.clone(), &NoopObserver).await
    }

    fn cached(&self, node: &str) -> bool {
        self.cache.get(&NodeId::from(node)).is_some()
    }

    /// Whether the wrapped cache holds an entry, bypassing the read rules
    fn stored(&self, node: &str) -> bool {
        interceptor(&self.cache).inner().get(&NodeId::from(node)).is_some()
    }
}

fn interceptor(cache: &Arc<dyn OutputCache>) -> &NoCacheInterceptor {
    cache
        .as_any()
        .downcast_ref::<NoCacheInterceptor>()
        .expect("cache installed through the runtime")
}

fn gc_prompt() -> Arc<Prompt> {
    Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent"),
        NodeDescriptor::new("2", "VAEDecode")
            .with_title("VAE Decode @gc")
            .with_link("samples", "1", 0),
    ]))
}

fn fast_schedule() -> ReclaimSchedule {
    ReclaimSchedule {
        attempts: 3,
        delay: Duration::from_millis(1),
    }
}

fn default_runtime() -> NoCacheRuntime {
    NoCacheRuntime::new(ConfigStore::new(ClassifierConfig::default()))
}

fn upscale_prompt(upscale_title: &str) -> Arc<Prompt> {
    Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent").with_literal("width", json!(512)),
        NodeDescriptor::new("2", "ImageUpscale")
            .with_title(upscale_title)
            .with_link("image", "1", 0),
        NodeDescriptor::new("3", "SaveImage").with_link("images", "2", 0),
    ]))
}

async fn wait_for_passes(worker: &ReclaimWorker, expected: u64) {
    for _ in 0..400 {
        if worker.stats().passes >= expected {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn test_marked_node_is_not_cached_with_absent_config_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = ConfigStore::load(dir.path().join("nocache_config.json"));
    assert_eq!(store.defaults(), ClassifierConfig::default());

    let harness = Harness::new(NoCacheRuntime::new(store));
    let prompt = upscale_prompt("Upscale @NC");

    let first = harness.run(&prompt).await.unwrap();

    assert_eq!(first, ExecutionSummary { executed: 3, cache_hits: 0 });
    assert!(harness.cached("1"));
    assert!(!harness.stored("2"));
    assert!(harness.cached("3"));
    assert_eq!(interceptor(&harness.cache).suppressed_writes(), 1);

    let second = harness.run(&prompt).await.unwrap();
    assert_eq!(second, ExecutionSummary { executed: 1, cache_hits: 2 });
}

#[tokio::test]
async fn test_two_config_nodes_fail_before_any_node_runs() {
    let harness = Harness::new(default_runtime());
    let prompt = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent"),
        NodeDescriptor::new("7", "NoCacheConfig").with_literal("debug", json!(true)),
        NodeDescriptor::new("8", "NoCacheConfig").with_literal("debug", json!(false)),
    ]));

    let err = harness.run(&prompt).await.unwrap_err();

    assert!(matches!(err, CoreError::ConfigurationAmbiguity { count: 2, .. }));
    assert!(err.is_blocking());
    assert!(harness.runner.calls().is_empty());
    assert!(!harness.cached("1"));
}

#[tokio::test]
async fn test_config_node_disables_rules_for_its_run_only() {
    let harness = Harness::new(default_runtime());
    let disabled = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("2", "ImageUpscale").with_title("Upscale @nc"),
        NodeDescriptor::new("9", "NoCacheConfig").with_literal("enabled", json!(false)),
    ]));

    harness.run(&disabled).await.unwrap();
    assert!(harness.stored("2"));

    // Same node without the config node: the stale entry is purged and the
    // fresh output is not cached.
    let enabled = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("2", "ImageUpscale").with_title("Upscale @nc"),
    ]));
    let summary = harness.run(&enabled).await.unwrap();

    assert_eq!(summary, ExecutionSummary { executed: 1, cache_hits: 0 });
    assert!(!harness.stored("2"));
    assert_eq!(harness.runtime.config().effective(), ClassifierConfig::default());
}

#[tokio::test]
async fn test_newly_marked_node_is_purged_and_memory_reclaimed() {
    let harness = Harness::new(default_runtime());

    harness.run(&upscale_prompt("Upscale")).await.unwrap();
    assert!(harness.cached("2"));
    assert_eq!(harness.runtime.reclaimer().stats().passes, 0);

    let summary = harness.run(&upscale_prompt("Upscale @nocache")).await.unwrap();

    assert_eq!(summary, ExecutionSummary { executed: 1, cache_hits: 2 });
    assert!(!harness.stored("2"));
    wait_for_passes(harness.runtime.reclaimer(), 1).await;
    assert_eq!(harness.runtime.reclaimer().stats().passes, 1);
}

#[tokio::test]
async fn test_gc_marker_schedules_three_reclamation_passes() {
    let mut reclaimer = MockReclaimer::new();
    reclaimer.expect_collect_garbage().times(3).returning(|| Ok(()));
    reclaimer
        .expect_release_device_memory()
        .times(3)
        .returning(|| Ok(()));
    let worker = ReclaimWorker::new(Arc::new(reclaimer)).with_schedule(fast_schedule());

    let runtime = NoCacheRuntime::with_parts(
        Arc::new(ConfigStore::new(ClassifierConfig::default())),
        Arc::new(NodeClassRegistry::new()),
        worker,
    );
    let harness = Harness::new(runtime);

    harness.run(&gc_prompt()).await.unwrap();
    wait_for_passes(harness.runtime.reclaimer(), 3).await;

    assert_eq!(harness.runtime.reclaimer().stats().passes, 3);
    // @gc does not affect caching
    assert!(harness.cached("2"));
}

#[tokio::test]
async fn test_gc_marker_on_cache_hit_schedules_nothing() {
    let worker = ReclaimWorker::new(Arc::new(NoopReclaimer)).with_schedule(fast_schedule());
    let runtime = NoCacheRuntime::with_parts(
        Arc::new(ConfigStore::new(ClassifierConfig::default())),
        Arc::new(NodeClassRegistry::new()),
        worker,
    );
    let harness = Harness::new(runtime);
    let prompt = gc_prompt();

    harness.run(&prompt).await.unwrap();
    wait_for_passes(harness.runtime.reclaimer(), 3).await;

    let summary = harness.run(&prompt).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(summary, ExecutionSummary { executed: 0, cache_hits: 2 });
    assert_eq!(harness.runtime.reclaimer().stats().passes, 3);
}

#[tokio::test]
async fn test_debug_run_reports_large_entries() {
    let harness = Harness::new(default_runtime());
    let prompt = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent").with_literal("mib", json!(1)),
        NodeDescriptor::new("2", "CLIPTextEncode").with_literal("text", json!("a cat")),
        NodeDescriptor::new("9", "NoCacheConfig").with_literal("debug", json!(true)),
    ]));

    harness.run(&prompt).await.unwrap();

    let report = harness.runtime.last_report().expect("debug run produces a report");
    assert_eq!(report.rows.len(), 1);
    assert_eq!(report.rows[0].node, "1");
    assert_eq!(report.rows[0].logical_bytes, 1_048_576);
    assert_eq!(report.rows[0].class_type.as_deref(), Some("EmptyLatent"));
}

#[tokio::test]
async fn test_non_debug_run_has_no_report() {
    let harness = Harness::new(default_runtime());
    let prompt = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent").with_literal("mib", json!(1)),
    ]));

    harness.run(&prompt).await.unwrap();

    assert!(harness.runtime.last_report().is_none());
}

#[tokio::test]
async fn test_failed_run_still_reports_and_releases_scope() {
    struct FailingRunner;

    #[async_trait]
    impl NodeRunner for FailingRunner {
        async fn run(
            &self,
            node: &NodeDescriptor,
            _inputs: ResolvedInputs,
        ) -> Result<NodeOutput, CoreError> {
            Err(CoreError::ExecutionError(format!("node {} exploded", node.id)))
        }
    }

    let runtime = Arc::new(default_runtime());
    let cache = runtime.install_cache(Arc::new(BasicCache::new()));
    let executor = runtime.wrap_executor(CachedGraphExecutor::new(cache, Arc::new(FailingRunner)));
    let prompt = Arc::new(Prompt::from_nodes(vec![
        NodeDescriptor::new("1", "EmptyLatent"),
        NodeDescriptor::new("9", "NoCacheConfig").with_literal("debug", json!(true)),
    ]));

    let err = executor.execute(prompt, &NoopObserver).await.unwrap_err();

    assert_eq!(err, CoreError::ExecutionError("node 1 exploded".to_string()));
    assert!(runtime.last_report().is_some());
    assert!(nocache_core::RunScope::current().is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_concurrent_runs_keep_their_own_settings() {
    /// Records the effective `debug` flag seen while running each node
    struct ConfigRecorder {
        store: Arc<ConfigStore>,
        seen: Mutex<Vec<(NodeId, bool)>>,
        barrier: tokio::sync::Barrier,
    }

    #[async_trait]
    impl NodeRunner for ConfigRecorder {
        async fn run(
            &self,
            node: &NodeDescriptor,
            _inputs: ResolvedInputs,
        ) -> Result<NodeOutput, CoreError> {
            self.barrier.wait().await;
            self.seen
                .lock()
                .push((node.id.clone(), self.store.effective().debug));
            Ok(NodeOutput::default())
        }
    }

    let runtime = Arc::new(default_runtime());
    let recorder = Arc::new(ConfigRecorder {
        store: runtime.config().clone(),
        seen: Mutex::new(Vec::new()),
        barrier: tokio::sync::Barrier::new(2),
    });

    let run = |node: &str, debug: bool| {
        let executor = runtime.wrap_executor(CachedGraphExecutor::new(
            Arc::new(BasicCache::new()),
            recorder.clone(),
        ));
        let prompt = Arc::new(Prompt::from_nodes(vec![
            NodeDescriptor::new(node, "KSampler"),
            NodeDescriptor::new(format!("{}-config", node), "NoCacheConfig")
                .with_literal("debug", json!(debug)),
        ]));
        tokio::spawn(async move { executor.execute(prompt, &NoopObserver).await })
    };

    let with_debug = run("a", true);
    let without_debug = run("b", false);
    with_debug.await.unwrap().unwrap();
    without_debug.await.unwrap().unwrap();

    let seen = recorder.seen.lock().clone();
    assert_eq!(seen.len(), 4);
    for (node_id, debug) in seen {
        assert_eq!(debug, node_id.as_str().starts_with('a'), "node {}", node_id);
    }
}

/// Parks the first run's node until released, so a second run can overlap it
struct GatedRunner {
    started: Notify,
    release: Notify,
}

#[async_trait]
impl NodeRunner for GatedRunner {
    async fn run(
        &self,
        node: &NodeDescriptor,
        _inputs: ResolvedInputs,
    ) -> Result<NodeOutput, CoreError> {
        let title = node.title().unwrap_or_default().to_string();
        if title.starts_with("first run") {
            self.started.notify_one();
            self.release.notified().await;
        }
        Ok(NodeOutput::single(OutputValue::Text(title)))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_overlapping_runs_on_a_shared_cache_classify_their_own_nodes() {
    let runtime = Arc::new(default_runtime());
    let cache = runtime.install_cache(Arc::new(BasicCache::new()));
    let runner = Arc::new(GatedRunner {
        started: Notify::new(),
        release: Notify::new(),
    });
    // same class and inputs: both runs derive the same key for node "1"
    let upscale = |title: &str| {
        Arc::new(Prompt::from_nodes(vec![NodeDescriptor::new("1", "ImageUpscale")
            .with_title(title)
            .with_literal("scale", json!(2))]))
    };

    let first = runtime.wrap_executor(CachedGraphExecutor::new(cache.clone(), runner.clone()));
    let first_prompt = upscale("first run @nc");
    let first_run = tokio::spawn(async move { first.execute(first_prompt, &NoopObserver).await });
    runner.started.notified().await;

    // binds its own prompt to the shared cache while the first run is mid-flight
    let second = runtime.wrap_executor(CachedGraphExecutor::new(cache.clone(), runner.clone()));
    second
        .execute(upscale("second run"), &NoopObserver)
        .await
        .unwrap();

    runner.release.notify_one();
    first_run.await.unwrap().unwrap();

    let wrapper = interceptor(&cache);
    assert_eq!(wrapper.suppressed_writes(), 1);
    let entries = wrapper.inner().snapshot().unwrap();
    assert_eq!(entries.len(), 1);
    assert_eq!(
        entries[0].value,
        NodeOutput::single(OutputValue::Text("second run".to_string()))
    );
}
