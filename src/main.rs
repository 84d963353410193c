use env_logger::Env;
use log::error;
use pgldapsync::apply::{self, Controller};
use pgldapsync::cli;
use std::process;

fn main() {
    let cli = cli::parse();

    // Logger config, overridable with RUST_LOG.
    let env = Env::new().default_filter_or(cli.log_filter());
    let mut builder = env_logger::Builder::from_env(env);
    if !cli.color() {
        builder.write_style(env_logger::WriteStyle::Never);
    }
    builder.init();

    let controller = Controller {
        config: cli.config.clone(),
        real: cli.real && !cli.dry,
        check: cli.check,
        skip_privileges: cli.skip_privileges,
        color: cli.color(),
    };

    match apply::run(&controller) {
        Ok(count) => {
            if controller.check && count > 0 {
                process::exit(1);
            }
        }
        Err(err) => {
            error!("Fatal error. err={}", err);
            process::exit(1);
        }
    }
}
