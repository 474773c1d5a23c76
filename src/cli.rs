//! Command-line interface and REPL

use anyhow::{Context, Result};
use colored::*;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;

use cipclient::{CipClient, ConnectionState, Direction, JoinValue, SignalKind, SubscriptionId};

enum Flow {
    Continue,
    Quit,
}

/// Interactive console; blocks until `quit`, Ctrl-C or end of input
pub fn run_repl(client: &CipClient) -> Result<()> {
    let mut rl = DefaultEditor::new()?;
    println!("{}", "=== CIP client console ===".bold().cyan());
    println!("Type {} for the list of commands\n", "help".yellow());

    loop {
        match rl.readline("cip> ") {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let _ = rl.add_history_entry(line);

                match execute(client, line) {
                    Ok(Flow::Continue) => {}
                    Ok(Flow::Quit) => break,
                    Err(e) => println!("{} {:#}", "error:".red().bold(), e),
                }
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}

/// Split off the first whitespace-delimited token
fn next_token(input: &str) -> (&str, &str) {
    let input = input.trim_start();
    input
        .split_once(char::is_whitespace)
        .unwrap_or((input, ""))
}

fn parse_join(token: &str) -> Result<u16> {
    token
        .parse()
        .with_context(|| format!("'{}' is not a valid join number", token))
}

fn parse_kind(token: &str) -> Result<SignalKind> {
    Ok(token.parse::<SignalKind>()?)
}

/// Direction argument, incoming when omitted
fn parse_direction(token: &str) -> Result<Direction> {
    if token.is_empty() {
        return Ok(Direction::Incoming);
    }
    Ok(token.parse::<Direction>()?)
}

fn execute(client: &CipClient, line: &str) -> Result<Flow> {
    let (command, rest) = next_token(line);

    match command {
        "set" => {
            let (kind, rest) = next_token(rest);
            let (join, rest) = next_token(rest);
            let kind = parse_kind(kind)?;
            let join = parse_join(join)?;
            let text = match kind {
                SignalKind::Serial => rest,
                _ => rest.trim(),
            };
            let value = JoinValue::parse(kind, text)?;
            client.set(kind, join, value.clone())?;
            println!("{} {} {:04} = {}", "→".green(), kind.short_name(), join, value);
        }
        "get" => {
            let (kind, rest) = next_token(rest);
            let (join, rest) = next_token(rest);
            let kind = parse_kind(kind)?;
            let join = parse_join(join)?;
            let direction = parse_direction(rest.trim())?;
            let value = client.get(kind, join, direction);
            println!("{} {} {:04} = {}", direction, kind.short_name(), join, value.to_string().bold());
        }
        "press" | "release" | "pulse" => {
            let join = parse_join(rest.trim())?;
            match command {
                "press" => client.press(join)?,
                "release" => client.release(join)?,
                _ => client.pulse(join)?,
            }
            println!("{} {} d {:04}", "→".green(), command, join);
        }
        "pressed" => {
            let joins = client.pressed_joins();
            if joins.is_empty() {
                println!("No joins pressed");
            } else {
                println!("Pressed: {:?}", joins);
            }
        }
        "update" => {
            client.update_request()?;
            println!("{} update request sent", "→".green());
        }
        "watch" => {
            let (kind, rest) = next_token(rest);
            let (join, rest) = next_token(rest);
            let kind = parse_kind(kind)?;
            let join = parse_join(join)?;
            let direction = parse_direction(rest.trim())?;

            let id = client.subscribe(
                kind,
                join,
                direction,
                move |kind: SignalKind, join: u16, value: &JoinValue| {
                    println!(
                        "{} {} {} {:04} = {}",
                        "⚡".yellow(),
                        direction,
                        kind.short_name(),
                        join,
                        value.to_string().bold()
                    );
                },
            );
            println!("Watching {} {} {:04} (id {})", direction, kind.short_name(), join, id);
        }
        "unwatch" => {
            let token = rest.trim();
            let id: u64 = token
                .parse()
                .with_context(|| format!("'{}' is not a subscription id", token))?;
            if client.unsubscribe(SubscriptionId::from(id)) {
                println!("Stopped watch {}", id);
            } else {
                println!("{} no watch with id {}", "warning:".yellow(), id);
            }
        }
        "dump" => {
            let direction = parse_direction(rest.trim())?;
            let snapshot = client.snapshot(direction);
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        "state" => {
            let state = client.connection_state();
            let text = state.to_string();
            let text = match state {
                ConnectionState::Active => text.green(),
                ConnectionState::Disconnected | ConnectionState::Closing => text.red(),
                _ => text.yellow(),
            };
            println!("Connection: {}", text.bold());
        }
        "time" => match client.processor_time() {
            Some(at) => println!("Processor time: {}", at),
            None => println!("Processor time not received yet"),
        },
        "help" => print_help(),
        "quit" | "exit" => return Ok(Flow::Quit),
        other => anyhow::bail!("unknown command '{}' (try 'help')", other),
    }

    Ok(Flow::Continue)
}

fn print_help() {
    let commands = [
        ("set <d|a|s> <join> <value>", "set an outgoing join"),
        ("get <d|a|s> <join> [in|out]", "show a join value (default: in)"),
        ("press <join>", "hold a digital join high"),
        ("release <join>", "release a held digital join"),
        ("pulse <join>", "send high then low"),
        ("pressed", "list held joins"),
        ("update", "request a full update from the processor"),
        ("watch <d|a|s> <join> [in|out]", "print changes of a join"),
        ("unwatch <id>", "stop a watch"),
        ("dump [in|out]", "print all known joins as JSON"),
        ("state", "show the connection state"),
        ("time", "show the processor clock"),
        ("quit", "exit"),
    ];

    println!("{}", "Commands:".bold());
    for (usage, description) in commands {
        println!("  {:<32} {}", usage.cyan(), description);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_next_token() {
        assert_eq!(next_token("set s 101 Hello Crestron!"), ("set", "s 101 Hello Crestron!"));
        assert_eq!(next_token("  pulse"), ("pulse", ""));

        let (_, rest) = next_token("s 101 Hello Crestron!");
        let (_, rest) = next_token(rest);
        assert_eq!(rest, "Hello Crestron!");
    }

    #[test]
    fn test_parse_direction_defaults_to_incoming() {
        assert_eq!(parse_direction("").unwrap(), Direction::Incoming);
        assert_eq!(parse_direction("out").unwrap(), Direction::Outgoing);
        assert!(parse_direction("up").is_err());
    }

    #[test]
    fn test_commands_update_outgoing_mirror() {
        let client = CipClient::new(cipclient::ClientConfig::new("127.0.0.1", 0x03)).unwrap();

        assert!(matches!(execute(&client, "set a 12 32456"), Ok(Flow::Continue)));
        assert!(matches!(execute(&client, "set s 101 Hello Crestron!"), Ok(Flow::Continue)));
        assert!(matches!(execute(&client, "pulse 3"), Ok(Flow::Continue)));
        assert!(execute(&client, "set d 0 1").is_err());
        assert!(execute(&client, "update").is_err());
        assert!(execute(&client, "frobnicate").is_err());
        assert!(matches!(execute(&client, "quit"), Ok(Flow::Quit)));

        assert_eq!(
            client.get(SignalKind::Analog, 12, Direction::Outgoing),
            JoinValue::Analog(32456)
        );
        assert_eq!(
            client.get(SignalKind::Serial, 101, Direction::Outgoing),
            JoinValue::Serial("Hello Crestron!".to_string())
        );
    }
}
