use envconfig::Envconfig;

use kafka_consumer::config::Config;
use kafka_consumer::error::AppError;
use kafka_consumer::telemetry::{init_tracing, Telemetry};
use kafka_consumer::App;

mod example;

use example::ExampleProcessor;

#[tokio::main]
async fn main() -> Result<(), AppError> {
    let config = Config::init_from_env().expect("Invalid configuration:");
    config.validate()?;

    let telemetry = Telemetry::init(&config)?;
    init_tracing(&telemetry);

    let app = App::new(config, telemetry)?;
    app.start(ExampleProcessor).await
}
