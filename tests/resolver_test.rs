//! 解析器集成测试
//!
//! 使用内存变更源和暂停的时钟，时间推进完全确定。

use flare_resolver::{
    ChangeSource, EndpointDiscover, ErrorCode, ErrorKind, MemorySource, RawRecord, Resolver,
    ResolverConfig, ResolverError, State, WatchState, Watcher, state_channel,
};
use futures::StreamExt;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::sleep;
use tower::discover::Change;

const SERVICE: &str = "user";

#[derive(Default)]
struct Recorder {
    states: Mutex<Vec<Arc<State>>>,
}

impl Recorder {
    fn revisions(&self) -> Vec<u64> {
        self.states.lock().unwrap().iter().map(|s| s.revision()).collect()
    }

    fn last(&self) -> Option<Arc<State>> {
        self.states.lock().unwrap().last().cloned()
    }
}

impl Watcher for Recorder {
    fn update_state(&self, state: Arc<State>) {
        self.states.lock().unwrap().push(state);
    }
}

fn config() -> ResolverConfig {
    ResolverConfig::new("default", ["grpc"]).with_resync_interval(Duration::ZERO)
}

async fn seeded_source() -> MemorySource {
    let source = MemorySource::new();
    source
        .register(RawRecord::new(SERVICE, "default", "grpc", "10.0.0.1", 9000).with_instance_id("a"))
        .await;
    source
        .register(RawRecord::new(SERVICE, "default", "http", "10.0.0.2", 8080).with_instance_id("b"))
        .await;
    source
}

fn resolver(source: &MemorySource, config: ResolverConfig) -> Resolver {
    Resolver::new("default", Arc::new(source.clone()), config)
}

async fn settle() {
    sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn first_watcher_receives_filtered_state() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());

    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Created);
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Watching);
    assert_eq!(recorder.revisions(), vec![1]);
    let state = recorder.last().unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.endpoints()[0].protocol(), "grpc");
    assert_eq!(state.endpoints()[0].address(), "10.0.0.1:9000");
    assert_eq!(state.endpoints()[0].name(), "a");

    let current = resolver.current_state(SERVICE).await.unwrap();
    assert!(Arc::ptr_eq(&current, &state));
    assert_eq!(source.active_subscriptions(SERVICE).await, 1);
}

#[tokio::test(start_paused = true)]
async fn signal_burst_is_coalesced_into_one_build() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;
    assert_eq!(source.list_calls(SERVICE).await, 1);

    for _ in 0..50 {
        source.signal(SERVICE).await;
        sleep(Duration::from_millis(2)).await;
    }
    sleep(Duration::from_secs(1)).await;

    assert_eq!(source.list_calls(SERVICE).await, 2);
    assert_eq!(recorder.revisions(), vec![1, 2]);
    let metrics = resolver.metrics();
    assert_eq!(metrics.signals_received, 50);
    assert_eq!(metrics.evaluations, 2);
}

#[tokio::test(start_paused = true)]
async fn signal_during_build_schedules_one_catch_up() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    source.set_list_delay(Duration::from_millis(100)).await;
    source.signal(SERVICE).await;
    // 防抖在 200ms 触发，构建持续到 300ms
    sleep(Duration::from_millis(250)).await;
    source.signal(SERVICE).await;
    source.signal(SERVICE).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(source.list_calls(SERVICE).await, 3);
    assert_eq!(recorder.revisions(), vec![1, 2, 3]);
}

#[tokio::test(start_paused = true)]
async fn revision_advances_on_every_successful_build() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    for _ in 0..4 {
        source.resync(SERVICE).await;
        settle().await;
    }

    assert_eq!(recorder.revisions(), vec![1, 2, 3, 4, 5]);
    let states = recorder.states.lock().unwrap().clone();
    for pair in states.windows(2) {
        assert!(pair[1].same_endpoints(&pair[0]));
    }
    assert_eq!(resolver.metrics().resyncs, 4);
}

#[tokio::test(start_paused = true)]
async fn list_failure_keeps_last_good_state() {
    let source = seeded_source().await;
    let errors = Arc::new(AtomicUsize::new(0));
    let hook_errors = errors.clone();
    let hook = move |service: &str, err: &ResolverError| {
        assert_eq!(service, SERVICE);
        assert_eq!(err.kind(), ErrorKind::Transient);
        hook_errors.fetch_add(1, Ordering::SeqCst);
    };
    let resolver = resolver(&source, config()).with_error_hook(Arc::new(hook));
    let first = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, first.clone()).await.unwrap();
    settle().await;
    source.resync(SERVICE).await;
    settle().await;
    source.resync(SERVICE).await;
    settle().await;
    assert_eq!(first.revisions(), vec![1, 2, 3]);

    source.fail_lists(Some("registry unreachable")).await;
    source.resync(SERVICE).await;
    settle().await;
    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(first.revisions(), vec![1, 2, 3]);

    let late = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, late.clone()).await.unwrap();
    settle().await;
    let state = late.last().unwrap();
    assert_eq!(state.revision(), 3);
    assert_eq!(state.len(), 1);

    source.fail_lists(None).await;
    source.resync(SERVICE).await;
    settle().await;
    assert_eq!(first.revisions(), vec![1, 2, 3, 4]);
    assert_eq!(late.revisions(), vec![3, 4]);

    let metrics = resolver.metrics();
    assert_eq!(metrics.builds_failed, 1);
    assert_eq!(metrics.builds_succeeded, 4);
}

#[tokio::test(start_paused = true)]
async fn list_timeout_is_reported_as_transient() {
    let source = seeded_source().await;
    source.set_list_delay(Duration::from_secs(10)).await;
    let errors = Arc::new(Mutex::new(Vec::new()));
    let hook_errors = errors.clone();
    let resolver = resolver(&source, config().with_timeout(Duration::from_secs(1)))
        .with_error_hook(Arc::new(move |_: &str, err: &ResolverError| {
            hook_errors.lock().unwrap().push(err.code());
        }));
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    sleep(Duration::from_secs(2)).await;

    assert!(recorder.revisions().is_empty());
    assert_eq!(*errors.lock().unwrap(), vec![ErrorCode::SourceTimeout]);
    assert!(resolver.current_state(SERVICE).await.is_none());
}

#[tokio::test(start_paused = true)]
async fn rewatch_after_idle_builds_immediately() {
    let source = seeded_source().await;
    // 重同步间隔远大于测试中推进的时间
    let resolver = resolver(&source, ResolverConfig::new("default", ["grpc"]));
    let first = Arc::new(Recorder::default());
    let handle: Arc<dyn Watcher> = first.clone();
    resolver.add_watch(SERVICE, handle.clone()).await.unwrap();
    settle().await;

    resolver.del_watch(SERVICE, &handle).await;
    settle().await;
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Idle);
    assert_eq!(resolver.watcher_count(SERVICE).await, 0);
    assert!(resolver.watched_services().await.is_empty());
    assert_eq!(source.active_subscriptions(SERVICE).await, 0);

    // Idle 期间的变化不会触发构建
    source.signal(SERVICE).await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(source.list_calls(SERVICE).await, 1);

    let second = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, second.clone()).await.unwrap();
    settle().await;

    // 先收到进入 Idle 前的快照，再收到新构建的快照
    assert_eq!(second.revisions(), vec![1, 2]);
    assert_eq!(first.revisions(), vec![1]);
    assert_eq!(source.active_subscriptions(SERVICE).await, 1);
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Watching);
}

#[tokio::test(start_paused = true)]
async fn rewatch_during_outage_receives_retained_state() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let first = Arc::new(Recorder::default());
    let handle: Arc<dyn Watcher> = first.clone();
    resolver.add_watch(SERVICE, handle.clone()).await.unwrap();
    settle().await;
    resolver.del_watch(SERVICE, &handle).await;
    settle().await;

    let retained = resolver.current_state(SERVICE).await.unwrap();
    assert_eq!(retained.revision(), 1);
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Idle);

    source.fail_lists(Some("registry unreachable")).await;
    let second = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, second.clone()).await.unwrap();
    settle().await;

    assert_eq!(second.revisions(), vec![1]);
    let state = second.last().unwrap();
    assert!(Arc::ptr_eq(&state, &retained));
    assert_eq!(state.endpoints()[0].address(), "10.0.0.1:9000");
    assert_eq!(resolver.metrics().builds_failed, 1);

    source.fail_lists(None).await;
    source.resync(SERVICE).await;
    settle().await;
    assert_eq!(second.revisions(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn watchers_of_one_service_share_each_snapshot() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, first.clone()).await.unwrap();
    resolver.add_watch(SERVICE, second.clone()).await.unwrap();
    settle().await;

    source.resync(SERVICE).await;
    settle().await;

    assert_eq!(first.revisions(), vec![1, 2]);
    assert_eq!(second.revisions(), vec![1, 2]);
    let a = first.states.lock().unwrap().clone();
    let b = second.states.lock().unwrap().clone();
    for (x, y) in a.iter().zip(b.iter()) {
        assert!(Arc::ptr_eq(x, y));
    }
    let current = resolver.current_state(SERVICE).await.unwrap();
    assert!(Arc::ptr_eq(&current, &a[1]));
}

#[tokio::test(start_paused = true)]
async fn del_watch_of_unknown_watcher_is_noop() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder: Arc<dyn Watcher> = Arc::new(Recorder::default());
    let stranger: Arc<dyn Watcher> = Arc::new(Recorder::default());

    resolver.del_watch(SERVICE, &stranger).await;
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    resolver.del_watch(SERVICE, &stranger).await;

    assert_eq!(resolver.watcher_count(SERVICE).await, 1);
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Watching);
}

#[tokio::test(start_paused = true)]
async fn same_watcher_can_watch_several_services() {
    let source = seeded_source().await;
    source
        .register(RawRecord::new("order", "default", "grpc", "10.0.1.1", 9100))
        .await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());

    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    resolver.add_watch("order", recorder.clone()).await.unwrap();
    settle().await;

    assert_eq!(recorder.revisions(), vec![1, 1]);
    assert_eq!(
        resolver.watched_services().await,
        vec!["order".to_string(), SERVICE.to_string()]
    );
}

#[tokio::test(start_paused = true)]
async fn stopped_resolver_rejects_new_watches() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    resolver.stop().await;
    settle().await;
    assert_eq!(source.active_subscriptions(SERVICE).await, 0);
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Stopped);

    let err = resolver
        .add_watch(SERVICE, Arc::new(Recorder::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::Stopped(_)));
    assert_eq!(err.kind(), ErrorKind::Terminal);

    source.resync(SERVICE).await;
    settle().await;
    assert_eq!(recorder.revisions(), vec![1]);
}

#[tokio::test(start_paused = true)]
async fn invalid_config_fails_fast() {
    let source = seeded_source().await;

    let resolver = Resolver::new(
        "default",
        Arc::new(source.clone()),
        ResolverConfig::new("", ["grpc"]),
    );
    let err = resolver
        .add_watch(SERVICE, Arc::new(Recorder::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::InvalidConfig(_)));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Created);

    let resolver = Resolver::new(
        "default",
        Arc::new(source.clone()),
        ResolverConfig::new("default", Vec::<String>::new()),
    );
    assert!(
        resolver
            .add_watch(SERVICE, Arc::new(Recorder::default()))
            .await
            .is_err()
    );

    let resolver = self::resolver(&source, config());
    assert!(
        resolver
            .add_watch("", Arc::new(Recorder::default()))
            .await
            .is_err()
    );
    assert_eq!(source.list_calls(SERVICE).await, 0);
}

#[tokio::test(start_paused = true)]
async fn unbounded_resync_interval_is_rejected() {
    let source = seeded_source().await;
    let resolver = resolver(
        &source,
        ResolverConfig::new("default", ["grpc"]).with_resync_interval(Duration::MAX),
    );
    let err = resolver
        .add_watch(SERVICE, Arc::new(Recorder::default()))
        .await
        .unwrap_err();
    assert!(matches!(err, ResolverError::InvalidConfig(_)));
    assert_eq!(resolver.watch_state(SERVICE).await, WatchState::Created);
    assert_eq!(source.list_calls(SERVICE).await, 0);
}

#[tokio::test(start_paused = true)]
async fn sub_second_resync_interval_is_honored() {
    let source = seeded_source().await;
    let resolver = resolver(
        &source,
        ResolverConfig::new("default", ["grpc"]).with_resync_interval(Duration::from_millis(500)),
    );
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();

    sleep(Duration::from_millis(1200)).await;

    assert_eq!(recorder.revisions(), vec![1, 2, 3]);
    assert_eq!(resolver.metrics().resyncs, 2);
}

#[tokio::test(start_paused = true)]
async fn periodic_resync_rebuilds_without_signals() {
    let source = seeded_source().await;
    let resolver = resolver(
        &source,
        ResolverConfig::new("default", ["grpc"]).with_resync_interval(Duration::from_secs(1)),
    );
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();

    sleep(Duration::from_millis(3500)).await;

    assert_eq!(recorder.revisions(), vec![1, 2, 3, 4]);
    assert_eq!(resolver.metrics().resyncs, 3);
}

#[tokio::test(start_paused = true)]
async fn native_resync_bypasses_debounce() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config().with_debounce(Duration::from_secs(5)));
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    source.signal(SERVICE).await;
    source.resync(SERVICE).await;
    settle().await;

    // 重同步吸收了等待中的信号
    assert_eq!(recorder.revisions(), vec![1, 2]);
    sleep(Duration::from_secs(10)).await;
    assert_eq!(recorder.revisions(), vec![1, 2]);
}

#[tokio::test(start_paused = true)]
async fn interrupted_subscription_is_restored() {
    let source = seeded_source().await;
    let errors = Arc::new(AtomicUsize::new(0));
    let hook_errors = errors.clone();
    let hook = move |_: &str, err: &ResolverError| {
        assert!(matches!(err, ResolverError::Subscribe { .. }));
        hook_errors.fetch_add(1, Ordering::SeqCst);
    };
    let resolver = resolver(&source, config()).with_error_hook(Arc::new(hook));
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();
    settle().await;

    source.close_subscriptions(SERVICE).await;
    sleep(Duration::from_secs(1)).await;

    assert_eq!(errors.load(Ordering::SeqCst), 1);
    assert_eq!(source.active_subscriptions(SERVICE).await, 1);
    // 重新订阅后补一次求值，弥补断开期间可能漏掉的事件
    assert_eq!(recorder.revisions(), vec![1, 2]);
    assert_eq!(resolver.metrics().subscribe_failures, 1);
}

#[tokio::test(start_paused = true)]
async fn subscribe_failures_back_off_until_recovery() {
    let source = seeded_source().await;
    source.fail_subscribes(Some("watch refused")).await;
    let resolver = resolver(&source, config());
    let recorder = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, recorder.clone()).await.unwrap();

    // 订阅尝试发生在 0ms, 100ms, 300ms, 700ms
    sleep(Duration::from_millis(650)).await;
    assert_eq!(resolver.metrics().subscribe_failures, 3);
    assert_eq!(recorder.revisions(), vec![1]);

    source.fail_subscribes(None).await;
    sleep(Duration::from_secs(2)).await;
    assert_eq!(source.active_subscriptions(SERVICE).await, 1);
    assert_eq!(resolver.metrics().subscribe_failures, 3);

    source
        .register(RawRecord::new(SERVICE, "default", "grpc", "10.0.0.3", 9000))
        .await;
    sleep(Duration::from_secs(1)).await;
    assert_eq!(recorder.last().unwrap().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn channel_watcher_feeds_tower_discover() {
    let source = seeded_source().await;
    let resolver = resolver(&source, config());
    let (watcher, rx) = state_channel();
    let mut discover = EndpointDiscover::new(rx);
    resolver.add_watch(SERVICE, watcher).await.unwrap();

    match discover.next().await {
        Some(Ok(Change::Insert(key, endpoint))) => {
            assert_eq!(key, "grpc://10.0.0.1:9000");
            assert_eq!(endpoint.address(), "10.0.0.1:9000");
        }
        _ => panic!("expected an insert"),
    }

    source.deregister(SERVICE, "a").await;
    match discover.next().await {
        Some(Ok(Change::Remove(key))) => assert_eq!(key, "grpc://10.0.0.1:9000"),
        _ => panic!("expected a remove"),
    }
    assert!(discover.is_empty());
    assert_eq!(discover.revision(), 2);
    assert_eq!(source.name(), "memory");
}

/// 在 `update_state` 中阻塞，直到测试放行
struct Blocked {
    gate: Mutex<std::sync::mpsc::Receiver<()>>,
}

impl Watcher for Blocked {
    fn update_state(&self, _state: Arc<State>) {
        let _ = self.gate.lock().unwrap().recv();
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn blocked_watcher_only_loses_its_own_updates() {
    let source = seeded_source().await;
    let resolver = resolver(
        &source,
        config()
            .with_debounce(Duration::from_millis(10))
            .with_watcher_buffer(1),
    );
    let (release, gate) = std::sync::mpsc::channel();
    let blocked = Arc::new(Blocked {
        gate: Mutex::new(gate),
    });
    let fast = Arc::new(Recorder::default());
    resolver.add_watch(SERVICE, blocked).await.unwrap();
    resolver.add_watch(SERVICE, fast.clone()).await.unwrap();
    while source.active_subscriptions(SERVICE).await == 0 {
        sleep(Duration::from_millis(5)).await;
    }

    for revision in 1..=6u64 {
        if revision > 1 {
            source.resync(SERVICE).await;
        }
        tokio::time::timeout(Duration::from_secs(5), async {
            while fast.revisions().last() != Some(&revision) {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("fast watcher must not wait for the blocked one");
    }
    assert_eq!(fast.revisions(), vec![1, 2, 3, 4, 5, 6]);

    let metrics = resolver.metrics();
    assert!(metrics.dropped_deliveries >= 4);
    assert_eq!(metrics.deliveries + metrics.dropped_deliveries, 12);

    for _ in 0..6 {
        let _ = release.send(());
    }
    resolver.stop().await;
}
