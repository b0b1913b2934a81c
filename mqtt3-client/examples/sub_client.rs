#[macro_use]
extern crate log;

use std::process;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use structopt::StructOpt;

use mqtt3_client::{ClientOptions, MqttClient, QoS, Result};

#[derive(StructOpt, Debug)]
#[structopt(
    name = "sub_client",
    about = "an MQTT 3.1.1 client for subscribing to topics"
)]
struct Opt {
    /// Specify the host to connect to.
    #[structopt(short, long, default_value = "localhost")]
    host: String,

    /// Connect to the port specified.
    #[structopt(short, long, default_value = "1883")]
    port: u16,

    /// The id to use for this client.
    /// Defaults to an id built from the process id.
    #[structopt(short, long)]
    id: Option<String>,

    /// The number of seconds between sending PING commands to the broker
    /// for the purposes of informing it we are still connected and functioning.
    #[structopt(short, long, default_value = "60")]
    keep_alive: u16,

    /// The MQTT topic to subscribe to.
    #[structopt(short, long)]
    topic: Vec<String>,

    /// Specify the quality of service desired for the incoming messages.
    #[structopt(short, long, default_value = "0", parse(try_from_str = parse_qos))]
    qos: QoS,
}

fn parse_qos(s: &str) -> std::result::Result<QoS, String> {
    match s {
        "0" | "at-most-once" => Ok(QoS::AtMostOnce),
        "1" | "at-least-once" => Ok(QoS::AtLeastOnce),
        "2" | "exactly-once" => Ok(QoS::ExactlyOnce),
        _ => Err(format!("invalid QoS: {}", s)),
    }
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    let opt = Opt::from_args();
    debug!("{:#?}", opt);

    let client_id = opt
        .id
        .clone()
        .unwrap_or_else(|| format!("subclient{}", process::id()));

    let options = ClientOptions::new(opt.host.clone(), opt.port, client_id)
        .keep_alive_interval(opt.keep_alive)
        .clean_session(true);

    let client = MqttClient::new(options);
    client.connect()?;

    for topic in &opt.topic {
        client.subscribe(
            topic,
            opt.qos,
            Some(Arc::new(|_client, data| {
                println!(
                    "{} {}",
                    data.topic_name,
                    String::from_utf8_lossy(data.message.payload)
                );
            })),
        )?;
    }

    // delivery, keep-alive and reconnect all run on the background thread
    loop {
        thread::sleep(Duration::from_secs(60));
    }
}
