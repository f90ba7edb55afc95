// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use relaymux::util;
use std::path::PathBuf;

use util::validators::{parse_socketaddr, validate_existing_file, validate_socketaddr};

mod certgen;
mod server;

fn main() {
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("quinn=warn,quinn_proto=warn,info"));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("server")
        .alias("-s")
        .about("Accept multiplexed sessions and relay their streams")
        .arg(
          Arg::new("config")
            .long("config")
            .short('f')
            .help("JSON server configuration; defaults apply when omitted")
            .validator(validate_existing_file)
            .takes_value(true)
            .required(false),
        )
        .arg(
          Arg::new("cert")
            .long("cert")
            .short('c')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .short('k')
            .validator(validate_existing_file)
            .takes_value(true)
            .required(true),
        )
        .arg(
          Arg::new("listen")
            .help("Address accepting QUIC sessions")
            .long("listen")
            .short('l')
            .validator(validate_socketaddr)
            .default_value("127.0.0.1:9090")
            .takes_value(true),
        ),
    )
    .subcommand(
      Command::new("cert")
        .about("Generate self-signed certificates for local usage")
        .arg(Arg::new("path").takes_value(true).required(true))
        .arg(
          Arg::new("san")
            .long("san")
            .takes_value(true)
            .required(false)
            .default_value("localhost"),
        ),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);
  let matches = app.get_matches();
  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<server::ServerArgs> {
  let required = |name: &str| {
    args
      .value_of(name)
      .ok_or_else(|| anyhow::Error::msg(format!("Missing required argument {}", name)))
  };
  Ok(server::ServerArgs {
    config: args.value_of("config").map(PathBuf::from),
    cert: PathBuf::from(required("cert")?),
    key: PathBuf::from(required("key")?),
    listen: parse_socketaddr(required("listen")?)?,
  })
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches.subcommand() {
    Some(("server", opts)) => {
      let args = server_arg_handling(opts)?;
      tracing::info!("Running as server with arguments {:#?}", args);
      server::server_main(args).await
    }
    Some(("cert", opts)) => {
      tracing::info!("Generating certs...");
      let path_raw = opts
        .value_of("path")
        .ok_or_else(|| anyhow::Error::msg("Path argument is required"))?;
      let san = opts.value_of("san").unwrap_or("localhost");
      certgen::certgen_main(path_raw.into(), san.into()).await
    }
    _ => Err(anyhow::Error::msg("A subcommand is required")),
  }
}
