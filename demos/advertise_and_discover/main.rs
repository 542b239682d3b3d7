//! Joins a broker, advertises a custom object, and resolves it back from
//! Discover -- the minimal round trip through Advertise/Discover/Resolve.

use std::io;
use std::time::Duration;

use clap::Parser;
use coaty_comm::{
    BindingDescriptor, CommEvent, CommunicationManager, CommunicationOptions, CoreType, EventData,
};
use futures::StreamExt;
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
    #[arg(long, default_value = "demo-agent")]
    agent_name: String,
}

fn main() {
    configure_logging();
    let args = CommandLineArgs::parse();

    let options = CommunicationOptions::new()
        .with_binding(BindingDescriptor::Mqtt {
            options: coaty_comm::binding::mqtt::MqttBindingOptions {
                broker_host: args.broker_host,
                broker_port: args.broker_port,
                keep_alive: Duration::from_secs(30),
                clean_session: true,
            },
        });

    let manager = CommunicationManager::new(args.agent_name, options);
    manager.start(None).expect("failed to join broker");
    info!("joined as {:?}", manager.identity().unwrap().object_id);

    let object = coaty_comm::CoatyObject::new("com.example.Counter", CoreType::CoatyObject, "counter-1").unwrap();
    manager
        .publish_advertise(CommEvent::advertise(manager.identity().unwrap().object_id, object).unwrap())
        .expect("advertise failed");
    info!("advertised counter-1");

    let discover = CommEvent::discover(
        manager.identity().unwrap().object_id,
        coaty_comm::event::DiscoverData::by_type(None, Some(vec!["com.example.Counter".to_string()])),
    )
    .unwrap();
    let mut resolutions = manager.publish_discover(discover).expect("discover failed");
    futures::executor::block_on(async {
        if let Some(result) = resolutions.next().await {
            match result {
                Ok(event) => {
                    if let EventData::Resolve(r) = event.data {
                        info!("resolved: {r:?}");
                    }
                }
                Err(e) => log::error!("resolve error: {e}"),
            }
        } else {
            info!("no responders within this run");
        }
    });

    manager.stop().expect("stop failed");
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
