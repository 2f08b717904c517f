/// Easy VM Fleet - Controller
///
/// 控制面主程序：连接状态存储，启动存储卷、虚拟网络和虚拟机控制器，
/// 并提供健康检查与指标接口

use axum::{extract::State, routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use controller::backends::{BridgeNetworkBackend, CommandVolumeBackend, HttpAgentClient};
use controller::config::Config;
use controller::controllers::{NetworkLifecycle, ReconcileSettings, Reconciler, ServerLifecycle, VolumeLifecycle};
use controller::metrics::{self, ReconcilerMetrics};
use controller::services::FleetService;
use controller::store::StateStore;
use controller::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 加载环境变量
    dotenvy::dotenv().ok();

    // 加载配置
    let cfg = Config::from_env()?;

    // 初始化日志
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.log_level)),
        )
        .init();

    info!("🚀 启动 Easy VM Fleet Controller...");
    info!("✅ 配置加载成功");

    // 连接状态存储，失败直接退出
    let store = connect_store(&cfg).await?;
    info!("✅ 状态存储连接成功 ({})", store.backend_type());

    let agent = Arc::new(HttpAgentClient::new(cfg.dispatch_policy())?);
    let state = AppState::new(
        store,
        agent,
        Arc::new(CommandVolumeBackend::new()),
        Arc::new(BridgeNetworkBackend::new()),
        cfg.image_dir.clone(),
    );

    let marker = FleetService::new(&state).ensure_version_marker().await?;
    info!("✅ 键空间版本: {}", marker.schema_version);

    // 启动控制器
    let shutdown = CancellationToken::new();
    let settings = |grace_secs: u64| ReconcileSettings {
        interval: cfg.reconcile_interval(),
        grace_period: Duration::from_secs(grace_secs),
        provisioning_timeout: cfg.provisioning_timeout(),
    };

    let handles = vec![
        Reconciler::new(
            state.store(),
            Arc::new(VolumeLifecycle::new(&state)),
            settings(cfg.volume_grace_secs),
            ReconcilerMetrics::register(&state.registry, "volume")?,
        )
        .spawn(shutdown.clone()),
        Reconciler::new(
            state.store(),
            Arc::new(NetworkLifecycle::new(&state)),
            settings(cfg.network_grace_secs),
            ReconcilerMetrics::register(&state.registry, "network")?,
        )
        .spawn(shutdown.clone()),
        Reconciler::new(
            state.store(),
            Arc::new(ServerLifecycle::new(&state)),
            settings(cfg.server_grace_secs),
            ReconcilerMetrics::register(&state.registry, "server")?,
        )
        .spawn(shutdown.clone()),
    ];
    info!("✅ 控制器已启动（间隔 {:?}）", cfg.reconcile_interval());

    // 构建应用路由
    let app = Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.listen_port));
    info!("🎯 服务器监听在 http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // 等待控制器完成当前一轮
    shutdown.cancel();
    futures::future::join_all(handles).await;
    info!("👋 控制面已退出");

    Ok(())
}

#[cfg(feature = "etcd")]
async fn connect_store(cfg: &Config) -> anyhow::Result<StateStore> {
    use controller::store::etcd::EtcdKv;

    let kv = EtcdKv::connect(&cfg.etcd_endpoints(), cfg.lock_ttl_secs).await?;
    Ok(StateStore::new(Arc::new(kv), cfg.namespace.as_str()))
}

#[cfg(not(feature = "etcd"))]
async fn connect_store(cfg: &Config) -> anyhow::Result<StateStore> {
    use controller::store::MemoryKv;

    tracing::warn!("未启用 etcd 特性，使用内存状态存储，进程退出后数据丢失");
    Ok(StateStore::new(Arc::new(MemoryKv::new()), cfg.namespace.as_str()))
}

async fn shutdown_signal(token: CancellationToken) {
    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("收到退出信号，正在停止..."),
        _ = token.cancelled() => {}
    }
    token.cancel();
}

async fn health_handler() -> &'static str {
    "OK"
}

async fn metrics_handler(State(state): State<AppState>) -> String {
    metrics::render(&state.registry)
}
