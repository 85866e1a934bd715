mod commands;
mod util;

use std::process::{ExitCode, Termination};

use fsck_core::core;

use commands::COMMAND_GROUPS;

/// Print top-level usage, commands grouped by category the way the
/// teacher's `bcachefs_usage` groups its own command tree.
fn usage() {
    println!("fsck-core - consistency checker and rebuilder for a journaled B+-tree filesystem");
    println!("usage: fsck-core <command> [<args>]\n");
    for (heading, names) in COMMAND_GROUPS {
        println!("{heading}");
        for name in *names {
            println!("  {name}");
        }
        println!();
    }
}

fn main() -> ExitCode {
    env_logger::init();

    let args: Vec<String> = std::env::args().collect();
    if args.len() < 2 {
        println!("missing command");
        usage();
        return ExitCode::FAILURE;
    }

    match args[1].as_str() {
        "--help" | "-h" | "help" => {
            usage();
            ExitCode::SUCCESS
        }
        "check" => commands::cmd_check(args[1..].to_vec(), false).report(),
        "fix-fixable" => commands::cmd_check(args[1..].to_vec(), true).report(),
        "rebuild-tree" => commands::cmd_rebuild_tree(args[1..].to_vec()).report(),
        "clean-attributes" => commands::cmd_clean_attributes(args[1..].to_vec()).report(),
        "rollback" => commands::cmd_rollback(args[1..].to_vec()).report(),
        "rebuild-sb" => commands::cmd_rebuild_sb(args[1..].to_vec()).report(),
        other => {
            println!("unknown command '{other}'");
            usage();
            ExitCode::FAILURE
        }
    }
}
