use console::style;
use tracing::debug;

use keel_config::KeelConfig;
use keel_ext::{CommandInvocation, ExtensionRuntime};

use super::{print_output, start_runtime};

#[derive(Debug, PartialEq)]
enum ShellCommand {
    Help,
    List,
    Commands,
    Run { command: String, args: Vec<String> },
    Enable(String),
    Disable(String),
    Unload(String),
    Exit,
    Empty,
    Unknown(String),
}

fn parse_line(line: &str) -> ShellCommand {
    let mut words = line.split_whitespace();
    let Some(head) = words.next() else {
        return ShellCommand::Empty;
    };
    let rest: Vec<String> = words.map(str::to_string).collect();
    let single = |make: fn(String) -> ShellCommand| match rest.as_slice() {
        [name] => make(name.clone()),
        _ => ShellCommand::Unknown(format!("usage: {head} <extension>")),
    };

    match head {
        "help" | "?" => ShellCommand::Help,
        "list" | "ls" => ShellCommand::List,
        "commands" => ShellCommand::Commands,
        "enable" => single(ShellCommand::Enable),
        "disable" => single(ShellCommand::Disable),
        "unload" => single(ShellCommand::Unload),
        "exit" | "quit" => ShellCommand::Exit,
        "run" => match rest.split_first() {
            Some((command, args)) => ShellCommand::Run {
                command: command.clone(),
                args: args.to_vec(),
            },
            None => ShellCommand::Unknown("usage: run <command> [args...]".into()),
        },
        // Bare command names are run directly.
        other => ShellCommand::Run {
            command: other.to_string(),
            args: rest,
        },
    }
}

fn print_help() {
    println!("  list                 installed extensions and their state");
    println!("  commands             available commands");
    println!("  run <cmd> [args...]  run a command (or just type the command name)");
    println!("  enable <ext>         re-activate a disabled extension");
    println!("  disable <ext>        deactivate an extension, keeping it installed");
    println!("  unload <ext>         drop an extension for this session");
    println!("  exit                 leave the shell");
}

async fn read_line() -> Option<String> {
    tokio::task::spawn_blocking(|| {
        use dialoguer::{Input, theme::ColorfulTheme};
        Input::<String>::with_theme(&ColorfulTheme::default())
            .with_prompt("keel")
            .allow_empty(true)
            .interact_text()
            .ok()
    })
    .await
    .ok()
    .flatten()
}

async fn execute(runtime: &ExtensionRuntime, command: ShellCommand) -> keel_core::Result<()> {
    match command {
        ShellCommand::Help => print_help(),
        ShellCommand::List => {
            for e in runtime.list_extensions() {
                println!("  {} v{} [{}]", style(&e.name).bold(), e.version, e.state);
            }
        }
        ShellCommand::Commands => {
            for c in runtime.list_commands() {
                println!("  {} — {}", style(&c.name).bold(), c.description);
            }
        }
        ShellCommand::Run { command, args } => {
            let output = runtime.invoke(&command, CommandInvocation::new(args)).await?;
            print_output(&output)?;
        }
        ShellCommand::Enable(name) => {
            runtime.enable(&name).await?;
            println!("✅ Enabled {name}");
        }
        ShellCommand::Disable(name) => {
            runtime.disable(&name).await?;
            println!("✅ Disabled {name}");
        }
        ShellCommand::Unload(name) => {
            runtime.unload(&name).await?;
            println!("✅ Unloaded {name}");
        }
        ShellCommand::Unknown(message) => println!("{message}"),
        ShellCommand::Exit | ShellCommand::Empty => {}
    }
    Ok(())
}

pub(super) async fn cmd_shell(config: KeelConfig) -> keel_core::Result<()> {
    let runtime = start_runtime(&config).await?;
    println!(
        "{} {} extension(s), {} command(s). Type 'help' for commands.",
        style("keel shell").bold(),
        runtime.list_extensions().len(),
        runtime.list_commands().len()
    );

    while let Some(line) = read_line().await {
        let command = parse_line(&line);
        debug!(?command, "shell input");
        if command == ShellCommand::Exit {
            break;
        }
        if let Err(e) = execute(&runtime, command).await {
            println!("{} {e}", style("error:").red());
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_builtins_and_bare_commands() {
        assert_eq!(parse_line("   "), ShellCommand::Empty);
        assert_eq!(parse_line("ls"), ShellCommand::List);
        assert_eq!(parse_line("disable demo"), ShellCommand::Disable("demo".into()));
        assert_eq!(
            parse_line("run demo-echo hi there"),
            ShellCommand::Run {
                command: "demo-echo".into(),
                args: vec!["hi".into(), "there".into()],
            }
        );
        assert_eq!(
            parse_line("demo-echo hi"),
            ShellCommand::Run {
                command: "demo-echo".into(),
                args: vec!["hi".into()],
            }
        );
        assert!(matches!(parse_line("enable"), ShellCommand::Unknown(_)));
        assert!(matches!(parse_line("run"), ShellCommand::Unknown(_)));
        assert_eq!(parse_line("quit"), ShellCommand::Exit);
    }
}
