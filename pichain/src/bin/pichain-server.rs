use structopt::StructOpt;

use pichain::{transport, Config, Node, Opt, SledStorage};

#[tokio::main]
async fn main() {
    let opt = Opt::from_args();
    let level = match opt.verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let config = match Config::load(&opt.config) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {}", err);
            std::process::exit(1);
        }
    };
    let self_id = config.self_id;

    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "[{}][{}][{}]: {}",
                self_id,
                record.level(),
                record.target(),
                message
            ))
        })
        .level_for("pichain", level)
        .level_for("tokio_util", log::LevelFilter::Off)
        .level_for("mio", log::LevelFilter::Off)
        .chain(std::io::stdout())
        .apply()
        .expect("logger already initialized");

    if let Err(err) = run(config).await {
        log::error!("fatal: {}", err);
        std::process::exit(err.exit_code());
    }
}

async fn run(config: Config) -> Result<(), pichain::Error> {
    std::fs::create_dir_all(&config.storage_dir)?;
    let storage = Box::new(SledStorage::open(&config.storage_dir)?);

    let (events_tx, events_rx) = tokio::sync::mpsc::channel(1024);
    let node = Node::bootstrap(&config, storage, events_tx.clone())?;

    let self_entry = config.self_entry().clone();

    let peer_bind = format!("0.0.0.0:{}", self_entry.peer_port);
    let peer_events = events_tx.clone();
    let self_id = config.self_id;
    let unreachable = std::sync::Arc::new(config.unreachable.clone());
    tokio::spawn(async move {
        if let Err(err) = transport::listen(self_id, peer_bind, unreachable, peer_events).await {
            log::error!("peer listener exited: {}", err);
        }
    });

    let client_bind = format!("0.0.0.0:{}", self_entry.client_port);
    let client_events = events_tx.clone();
    tokio::spawn(async move {
        if let Err(err) = pichain::client::listen(client_bind, client_events).await {
            log::error!("client listener exited: {}", err);
        }
    });

    // Dial only higher-numbered peers; lower-numbered peers dial us, so
    // every link is established exactly once. Peers marked unreachable
    // (partition simulation) are skipped entirely.
    for (peer_id, entry) in config.peers.clone() {
        if peer_id <= config.self_id || !config.is_reachable(peer_id) {
            continue;
        }
        let addr = format!("{}:{}", entry.host, entry.peer_port);
        transport::connect(config.self_id, peer_id, addr, events_tx.clone());
    }

    let tick_timeout = config.timeout;
    let tick_events = events_tx.clone();
    tokio::spawn(async move {
        let period = std::cmp::max(tick_timeout / 4, std::time::Duration::from_millis(10));
        let mut interval = tokio::time::interval(period);
        loop {
            interval.tick().await;
            if tick_events.send(transport::Event::Tick).await.is_err() {
                return;
            }
        }
    });

    node.run(events_rx).await;
    Ok(())
}
