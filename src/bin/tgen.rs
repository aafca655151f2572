#[macro_use]
extern crate clap;
#[macro_use]
extern crate log;
extern crate pretty_env_logger;
extern crate tgen;

use std::process;

use clap::{App, Arg};
use tgen::app;

static GRAPH_PATH_ARG: &'static str = "GRAPH";

fn main() {
    drop(pretty_env_logger::init());

    let opts = mk_app().get_matches();
    let graph_path = opts.value_of(GRAPH_PATH_ARG).unwrap();

    let result = app::run_from_path(graph_path);
    match &result {
        Ok(summary) => info!(
            "completed: client {}/{} ok, server {}/{} ok, {} bytes in {}ms",
            summary.client_succeeded,
            summary.client_attempted,
            summary.server_succeeded,
            summary.server_attempted,
            summary.bytes_transferred,
            summary.wall_time.as_millis()
        ),
        Err(e) => error!("{}", e),
    }
    process::exit(app::exit_code(&result));
}

fn mk_app() -> App<'static, 'static> {
    App::new(crate_name!())
        .version(crate_version!())
        .about(crate_description!())
        .arg(
            Arg::with_name(GRAPH_PATH_ARG)
                .required(true)
                .index(1)
                .help("Action graph file (YAML or JSON)."),
        )
}
