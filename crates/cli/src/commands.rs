//! Clap command tree definition.
//!
//! One tree shared by shell mode (parsed directly from argv) and REPL
//! mode (parsed per line via `try_get_matches_from`).

use clap::{Arg, ArgAction, Command};

/// Build the complete CLI command tree.
pub fn build_cli() -> Command {
    Command::new("helio")
        .about("Administration CLI for HelioDB")
        .subcommand_required(false)
        .arg(
            Arg::new("server")
                .long("server")
                .help("Administration endpoint (host:port)")
                .global(true),
        )
        .subcommand(
            Command::new("bind")
                .about("Bind this session to a server administration endpoint")
                .arg(Arg::new("address").required(true)),
        )
        .subcommand(Command::new("status").about("Show the bound node's state"))
        .subcommand(
            Command::new("monitor")
                .about("Poll and print node state until interrupted")
                .arg(
                    Arg::new("interval-ms")
                        .long("interval-ms")
                        .default_value("1000"),
                ),
        )
        .subcommand(Command::new("failover").about("Ask the primary to step down"))
        .subcommand(
            Command::new("primary")
                .about("Promote this site to global-write primary")
                .arg(
                    Arg::new("confirm")
                        .long("confirm")
                        .help("Proceed even when the peer site appears primary")
                        .action(ArgAction::SetTrue),
                ),
        )
        .subcommand(Command::new("standby").about("Demote this site to global-write standby"))
        .subcommand(
            Command::new("cluster-config")
                .about("Edit a cluster configuration file")
                .subcommand_required(true)
                .subcommand(Command::new("new").about("Start an empty configuration"))
                .subcommand(
                    Command::new("load")
                        .about("Load a configuration file")
                        .arg(Arg::new("file").required(true)),
                )
                .subcommand(
                    Command::new("save")
                        .about("Validate and write the configuration")
                        .arg(Arg::new("file").required(true)),
                )
                .subcommand(Command::new("show").about("Print the working configuration"))
                .subcommand(
                    Command::new("create-node")
                        .about("Make the working configuration a standalone node")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("host").required(true)),
                )
                .subcommand(
                    Command::new("create-ha")
                        .about("Make the working configuration a two-node HA cluster")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("first-host").required(true))
                        .arg(Arg::new("second-host").required(true))
                        .arg(
                            Arg::new("witness-path")
                                .long("witness-path")
                                .help("Shared-folder witness path")
                                .required(true),
                        )
                        .arg(
                            Arg::new("election-timeout-ms")
                                .long("election-timeout-ms")
                                .default_value("2000"),
                        ),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Delete an element by name")
                        .arg(Arg::new("name").required(true)),
                ),
        )
        .subcommand(
            Command::new("persist-config")
                .about("Edit and apply the persistence configuration")
                .subcommand_required(true)
                .subcommand(
                    Command::new("create")
                        .about("Add a log stream")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("directory").required(true))
                        .arg(Arg::new("snapshot-directory").required(true))
                        .arg(
                            Arg::new("max-size")
                                .long("max-size")
                                .default_value("67108864"),
                        )
                        .arg(
                            Arg::new("packed")
                                .long("packed")
                                .action(ArgAction::SetTrue),
                        ),
                )
                .subcommand(
                    Command::new("modify")
                        .about("Change a stream's size or packing")
                        .arg(Arg::new("name").required(true))
                        .arg(Arg::new("max-size").long("max-size"))
                        .arg(
                            Arg::new("packed")
                                .long("packed")
                                .value_parser(clap::value_parser!(bool)),
                        ),
                )
                .subcommand(
                    Command::new("delete")
                        .about("Remove a log stream")
                        .arg(Arg::new("name").required(true)),
                )
                .subcommand(Command::new("apply").about("Apply the working configuration")),
        )
        .subcommand(
            Command::new("update-assemblies")
                .about("Upload an assembly bundle archive")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("get-assemblies")
                .about("Download the installed assembly bundle archive")
                .arg(Arg::new("file").required(true)),
        )
        .subcommand(
            Command::new("trace-level")
                .about("Set the engine trace level (0..4)")
                .arg(Arg::new("level").required(true)),
        )
        .subcommand(
            Command::new("user-trace-level")
                .about("Set the user-code trace level (0..4)")
                .arg(Arg::new("level").required(true)),
        )
        .subcommand(Command::new("exit").about("Leave the interactive shell"))
}
