use anyhow::{Context, Result};
use ghostpass_chain::{AcceptanceSource, IndexerTableSource, NativeRestSource, TransferSource};
use ghostpass_config::{GhostPassConfig, PurchaseMode};
use ghostpass_core::OrderingMode;
use ghostpass_engine::Engine;
use ghostpass_rpc::ws::{spawn_broadcaster, WsRegistry};
use ghostpass_rpc::RpcState;
use ghostpass_storage::PgStore;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Wires the store, the chain sources, the engine loops, the broadcaster and
/// the HTTP/WS server, then runs until a shutdown signal.
pub async fn run_node(cfg: GhostPassConfig) -> Result<()> {
    let store = Arc::new(PgStore::connect(&cfg.database_url, cfg.db_pool_size).await?);

    let table_mode = cfg.use_ponder_data || cfg.purchase_mode == PurchaseMode::Evm;
    let (transfers, acceptance, default_ordering): (
        Arc<dyn TransferSource>,
        Arc<dyn AcceptanceSource>,
        OrderingMode,
    ) = if table_mode {
        let source = Arc::new(
            IndexerTableSource::new(store.pool().clone(), &cfg.ponder_schema)
                .context("configuring indexer table source")?,
        );
        info!(schema = %cfg.ponder_schema, "using indexer transfer tables");
        (source.clone(), source, OrderingMode::BlockIndex)
    } else {
        let source = Arc::new(NativeRestSource::new(&cfg.contract_rpc_url));
        info!(rpc = %cfg.contract_rpc_url, "using native chain adapter");
        (source.clone(), source, OrderingMode::BlueScore)
    };

    let engine = Engine::new(
        store.clone(),
        transfers,
        acceptance,
        cfg.indexer_poll_interval(),
    );
    let _loops = engine.spawn();

    let registry = Arc::new(WsRegistry::new());
    let _broadcaster = spawn_broadcaster(
        store.clone(),
        registry.clone(),
        cfg.ws_broadcast_interval(),
    );

    let state = RpcState {
        store,
        registry,
        ticket_secret: Arc::new(cfg.ticket_secret.clone()),
        default_ordering,
    };
    let addr: SocketAddr = cfg
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.listen_addr))?;

    tokio::select! {
        result = ghostpass_rpc::serve(addr, state, cfg.cors_origin_list()) => result,
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}
