use clap::{Arg, ArgMatches, Command};

pub fn cli() -> Command<'static> {
    Command::new(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .about(env!("CARGO_PKG_DESCRIPTION"))
        .subcommand_required(true)
        .subcommand(run())
}

fn run() -> Command<'static> {
    Command::new("run")
        .visible_alias("r")
        .about("Starts the bot and begins listening for commands")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .takes_value(true)
                .value_name("path")
                .help("Path to the TOML configuration file. Mutually exclusive with the CONFIG environment variable"),
        )
}

pub fn config_path(matches: &ArgMatches) -> Option<&str> {
    matches.get_one::<String>("config").map(|s| s.as_str())
}
