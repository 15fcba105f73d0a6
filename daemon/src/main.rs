//! `gravitond`: the cluster node daemon. Composes the kernel runtime,
//! installs the network master, and serves until the operator stops it or
//! the last waited-for application finishes.

mod config;

use std::sync::Arc;

use quark::logging::{self, o};

use graviton::discovery::{kernels, MasterProperties, NetworkMaster};
use graviton::factory::{Factory, Properties};
use graviton::ifaddr::IfaceAddr;
use graviton::kernel::Kernel;
use graviton::types::TypeRegistry;

fn main() {
    let config = match config::from_args(std::env::args().skip(1)) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("gravitond: {}", err);
            std::process::exit(2);
        }
    };

    let log = logging::init(&config.log_level);
    logging::info!(log, "starting"; "port" => config.port, "fanout" => config.fanout);

    let interfaces: Vec<IfaceAddr> = config
        .interfaces
        .iter()
        .filter_map(|text| match text.parse() {
            Ok(ifaddr) => Some(ifaddr),
            Err(err) => {
                logging::error!(log, "skipping interface"; "error" => %err);
                None
            }
        })
        .collect();

    if let Err(err) = std::fs::create_dir_all(&config.transactions_directory) {
        logging::error!(log, "transactions directory unavailable";
                        "path" => %config.transactions_directory.display(),
                        "error" => %err);
        std::process::exit(2);
    }

    let mut types = TypeRegistry::new();
    kernels::register_types(&mut types);

    let factory = Arc::new(Factory::new(
        Properties {
            num_threads: config.num_threads,
            port: config.port,
            connection_timeout: config.connection_timeout(),
            max_connection_attempts: config.max_connection_attempts,
            transactions_directory: config.transactions_directory.clone(),
            allow_root: config.allow_root,
            unix_socket: Some(config.socket_path()),
            this_app: graviton::app::ROOT_APP,
        },
        types,
        &log,
    ));
    factory.start();

    // the master gets its identity up front so the pipelines know where to
    // send events before it ever runs
    let services = factory.services().clone();
    let master_id = services.ids.issue_local();
    services.router.set_master(master_id);
    factory.remote().set_event_listener(master_id);

    let mut master = NetworkMaster::new(
        MasterProperties {
            fanout: config.fanout,
            port: config.port,
            scan_interval: config.network_scan_interval(),
            update_interval: config.network_interface_update_interval(),
            allowed: Vec::new(),
        },
        Box::new(move || interfaces.clone()),
        factory.remote().clone(),
        Some(factory.process().clone()),
        &log,
    );
    master.header_mut().set_id(master_id);
    factory.send(Box::new(master));

    {
        let shutdown = services.shutdown.clone();
        let handler_log = log.new(o!());
        if let Err(err) = ctrlc::set_handler(move || {
            logging::info!(handler_log, "interrupted, shutting down");
            shutdown.request(0);
        }) {
            logging::warn!(log, "unable to install the signal handler"; "error" => %err);
        }
    }

    let code = factory.wait();
    logging::info!(log, "stopped"; "exit_code" => code);
    std::process::exit(code);
}
