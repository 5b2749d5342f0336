use clap::{Parser, Subcommand};
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::process;
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use mdns_engine::{Config, InterfaceSelection, Querier, Responder, Service};
use mdns_types::protocol::types::{DomainName, QueryType, RecordType, RecordTypeWithData};

fn begin_logging() {
    let log_format = if let Ok(var) = env::var("RUST_LOG_FORMAT") {
        let mut set = HashSet::new();
        for s in var.split(',') {
            set.insert(s.to_string());
        }
        set
    } else {
        HashSet::new()
    };

    let logger = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_ansi(!log_format.contains("no-ansi"));

    if log_format.contains("json") {
        if log_format.contains("no-time") {
            logger.json().without_time().init();
        } else {
            logger.json().init();
        }
    } else if log_format.contains("pretty") {
        if log_format.contains("no-time") {
            logger.pretty().without_time().init();
        } else {
            logger.pretty().init();
        }
    } else if log_format.contains("compact") {
        if log_format.contains("no-time") {
            logger.compact().without_time().init();
        } else {
            logger.compact().init();
        }
    } else if log_format.contains("no-time") {
        logger.without_time().init();
    } else {
        logger.init();
    }
}

// the doc comments for this struct turn into the CLI help text
#[derive(Debug, Parser)]
/// An mDNS / DNS-SD responder and browser for local networks.
///
/// announced advertises services on the link via multicast DNS
/// (RFC 6762): it probes for name uniqueness, announces, answers
/// queries, and says goodbye on the way out.  It can also browse for
/// a service type with a one-shot query.
///
/// It speaks IPv4 only.
struct Args {
    /// Interface to use, can be specified more than once (default:
    /// all usable IPv4 multicast interfaces)
    #[clap(short, long)]
    interface: Vec<String>,

    /// Receive our own multicast traffic (useful for testing)
    #[clap(long, action(clap::ArgAction::SetTrue))]
    multicast_loopback: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Advertise a service until interrupted
    Register {
        /// Instance name, e.g. "My Printer"
        #[clap(short = 'n', long)]
        instance: String,

        /// Service type, e.g. "_ipp._tcp"
        #[clap(short = 't', long = "type")]
        service_type: String,

        /// Port the service listens on
        #[clap(short, long)]
        port: u16,

        /// Hostname to advertise (default: the machine hostname)
        #[clap(long)]
        hostname: Option<String>,

        /// TXT entry as key=value, can be specified more than once
        #[clap(long = "txt")]
        txt: Vec<String>,
    },

    /// Send one browse query for a service type and print the
    /// instances that answer
    Browse {
        /// Service type, e.g. "_ipp._tcp"
        service_type: String,

        /// How long to wait for answers, in seconds
        #[clap(long, default_value_t = 3)]
        wait: u64,
    },
}

fn engine_config(args: &Args) -> Config {
    Config {
        interfaces: if args.interface.is_empty() {
            InterfaceSelection::Default
        } else {
            InterfaceSelection::Named(args.interface.clone())
        },
        multicast_loopback: args.multicast_loopback,
        ..Config::default()
    }
}

fn parse_txt(entries: &[String]) -> BTreeMap<String, String> {
    let mut txt = BTreeMap::new();
    for entry in entries {
        match entry.split_once('=') {
            Some((key, value)) => txt.insert(key.to_string(), value.to_string()),
            None => txt.insert(entry.clone(), String::new()),
        };
    }
    txt
}

async fn run_register(
    config: Config,
    instance: String,
    service_type: String,
    port: u16,
    hostname: Option<String>,
    txt: Vec<String>,
) {
    let responder = match Responder::new(config) {
        Ok(responder) => responder,
        Err(error) => {
            tracing::error!(%error, "could not start responder");
            process::exit(1);
        }
    };

    let service = Service {
        instance,
        service_type,
        port,
        hostname,
        txt: parse_txt(&txt),
    };

    let handle = match responder.register(service).await {
        Ok(handle) => handle,
        Err(error) => {
            tracing::error!(%error, "could not register service");
            process::exit(1);
        }
    };
    tracing::info!(instance = %handle.instance, "service announced");

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(error) => {
            tracing::error!(?error, "could not subscribe to SIGTERM");
            process::exit(1);
        }
    };

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!("shutting down");
    responder.shutdown().await;

    let counters = responder.counters();
    tracing::info!(
        datagrams_received = counters.datagrams_received,
        datagrams_sent = counters.datagrams_sent,
        malformed = counters.malformed,
        queries_answered = counters.queries_answered,
        "final counters"
    );
}

async fn run_browse(config: Config, service_type: String, wait: u64) {
    let querier = match Querier::new(config) {
        Ok(querier) => querier,
        Err(error) => {
            tracing::error!(%error, "could not start querier");
            process::exit(1);
        }
    };

    let Some(name) = DomainName::from_dotted_string(&format!("{service_type}.local")) else {
        tracing::error!(%service_type, "not a valid service type");
        process::exit(1);
    };

    let records = match querier
        .query(
            name,
            QueryType::Record(RecordType::PTR),
            Duration::from_secs(wait),
        )
        .await
    {
        Ok(records) => records,
        Err(error) => {
            tracing::error!(%error, "browse failed");
            process::exit(1);
        }
    };

    for record in &records {
        if let RecordTypeWithData::PTR { ptrname } = &record.rtype_with_data {
            println!("{}", ptrname.to_dotted_string());
        }
    }
    if records.is_empty() {
        tracing::info!(%service_type, "no instances answered");
    }

    querier.shutdown();
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    begin_logging();

    let config = engine_config(&args);
    match args.command {
        Command::Register {
            instance,
            service_type,
            port,
            hostname,
            txt,
        } => run_register(config, instance, service_type, port, hostname, txt).await,
        Command::Browse { service_type, wait } => {
            run_browse(config, service_type, wait).await;
        }
    }
}
