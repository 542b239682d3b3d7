//! Runs an agent with a single IoNode exposing one IoSource. Once a router
//! elsewhere in the deployment associates the source to a route, this demo
//! publishes a counter value on it every second and logs its IoState.

use std::io;
use std::thread;
use std::time::Duration;

use clap::Parser;
use coaty_comm::event::RawPayload;
use coaty_comm::object::{IoActor, IoSource};
use coaty_comm::{BindingDescriptor, CommunicationManager, CommunicationOptions};
use log::{info, LevelFilter};
use log4rs::append::console::ConsoleAppender;
use log4rs::config::{Appender, Root};
use log4rs::Config;

#[derive(Parser)]
struct CommandLineArgs {
    #[arg(long, default_value = "localhost")]
    broker_host: String,
    #[arg(long, default_value_t = 1883)]
    broker_port: u16,
    #[arg(long, default_value = "io-demo-agent")]
    agent_name: String,
    #[arg(long, default_value = "sensors")]
    context_name: String,
}

fn main() {
    configure_logging();
    let args = CommandLineArgs::parse();

    let source = IoSource {
        object: coaty_comm::CoatyObject::new("coaty.IoSource", coaty_comm::CoreType::IoSource, "counter").unwrap(),
        value_type: "com.example.Counter".to_string(),
        external_route: None,
    };
    let source_id = source.id();

    let mut io_context_nodes = std::collections::BTreeMap::new();
    io_context_nodes.insert(
        args.context_name.clone(),
        coaty_comm::config::IoContextNodeConfig {
            io_sources: vec![source],
            io_actors: Vec::<IoActor>::new(),
            characteristics: Default::default(),
        },
    );

    let options = CommunicationOptions::new()
        .with_binding(BindingDescriptor::Mqtt {
            options: coaty_comm::binding::mqtt::MqttBindingOptions {
                broker_host: args.broker_host,
                broker_port: args.broker_port,
                keep_alive: Duration::from_secs(30),
                clean_session: true,
            },
        });
    let options = coaty_comm::CommunicationOptions {
        common: coaty_comm::config::CommonOptions {
            agent_identity: None,
            io_context_nodes,
        },
        ..options
    };

    let manager = CommunicationManager::new(args.agent_name, options);
    manager.start(None).expect("failed to join broker");

    let mut state = manager.observe_io_state_of_source(source_id).expect("not a local source");
    let state_manager_handle = thread::spawn(move || {
        futures::executor::block_on(async {
            use futures::StreamExt;
            while let Some(s) = state.next().await {
                info!("io state for counter source: {s:?}");
            }
        });
    });

    let mut i: u64 = 0;
    loop {
        manager
            .publish_io_value(source_id, RawPayload::Text(i.to_string()))
            .expect("publish_io_value failed");
        i += 1;
        thread::sleep(Duration::from_secs(1));
        if i >= 10 {
            break;
        }
    }

    manager.stop().expect("stop failed");
    drop(state_manager_handle);
}

fn configure_logging() {
    log4rs::init_file("logging-config.yaml", log4rs::config::Deserializers::default()).unwrap_or_else(|e| {
        match e.downcast_ref::<io::Error>() {
            Some(os_err) if os_err.kind() == io::ErrorKind::NotFound => {
                let stdout = ConsoleAppender::builder().build();
                let conf = Config::builder()
                    .appender(Appender::builder().build("stdout", Box::new(stdout)))
                    .build(Root::builder().appender("stdout").build(LevelFilter::Info))
                    .unwrap();
                log4rs::init_config(conf).unwrap();
            }
            other_error => panic!("config problem: {other_error:?}"),
        }
    });
}
