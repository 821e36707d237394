use std::time::Duration;

use clap::Parser;
use color_eyre::Result;
use imagegen_engine::{
    Credential,
    api::{self, TASK_TYPE_IMAGE_GENERATION},
    options::DEFAULT_BASE_URL,
    poller::classify,
    transport::{HttpRequest, ReqwestTransport, Transport},
};

/// Query a task once and print how the poller would classify the answer.
#[derive(clap::Parser)]
struct Arg {
    key: String,
    task_id: String,
    #[arg(long, default_value = DEFAULT_BASE_URL)]
    base_url: String,
    /// Show the raw verdict without the `task not found` workaround.
    #[arg(long)]
    no_sentinel: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    pretty_env_logger::init();
    let Arg {
        key,
        task_id,
        base_url,
        no_sentinel,
    } = Arg::parse();

    let credential = Credential::new(key)?;
    let transport = ReqwestTransport::new(Duration::from_secs(30))?;
    let req = HttpRequest::get(
        api::task_url(base_url.trim_end_matches('/'), &task_id),
        Duration::from_secs(30),
    )
    .header("Authorization", credential.bearer())
    .header(api::TASK_TYPE_HEADER, TASK_TYPE_IMAGE_GENERATION);

    let outcome = transport.send(req).await;
    match &outcome {
        Ok(resp) => println!("HTTP {}\n{}", resp.status, resp.text()),
        Err(e) => println!("Transport error: {e}"),
    }
    println!("Classified as: {:#?}", classify(&outcome, !no_sentinel));

    Ok(())
}
