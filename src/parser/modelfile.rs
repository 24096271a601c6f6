use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::io::BufRead;

/// One Modelfile directive. `FROM` is normalized to `model` (the name the
/// builder dispatches on) and `PARAMETER key value` to a command named after
/// the parameter key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub name: String,
    pub args: String,
}

/// Parses a Modelfile into its ordered command list.
///
/// The syntax is line oriented: `COMMAND args`, `#` comments, and
/// triple-quoted (`"""`) arguments that may span lines.
pub fn parse<R: BufRead>(reader: R) -> Result<Vec<Command>> {
    let mut commands = Vec::new();
    let mut multiline: Option<Command> = None;

    for line_result in reader.lines() {
        let line = line_result?;

        if let Some(mut cmd) = multiline.take() {
            if let Some(end) = line.find(r#"""""#) {
                cmd.args.push('\n');
                cmd.args.push_str(&line[..end]);
                commands.push(cmd);
            } else {
                cmd.args.push('\n');
                cmd.args.push_str(&line);
                multiline = Some(cmd);
            }
            continue;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (keyword, rest) = split_command(trimmed);
        let (name, args) = match keyword.to_lowercase().as_str() {
            "from" => ("model".to_string(), rest),
            "parameter" => {
                let (key, value) = split_command(rest);
                if key.is_empty() {
                    bail!("missing parameter name");
                }
                (key.to_lowercase(), value)
            }
            k @ ("model" | "adapter" | "license" | "template" | "system" | "embed") => (k.to_string(), rest),
            _ => bail!(
                "command must be one of \"from\", \"license\", \"template\", \"system\", \"adapter\", \"parameter\""
            ),
        };

        if let Some(body) = args.strip_prefix(r#"""""#) {
            if let Some(end) = body.find(r#"""""#) {
                commands.push(Command { name, args: body[..end].to_string() });
            } else {
                multiline = Some(Command { name, args: body.to_string() });
            }
            continue;
        }

        commands.push(Command {
            name,
            args: unquote(args).to_string(),
        });
    }

    if let Some(cmd) = multiline {
        bail!("unterminated multiline argument for {}", cmd.name.to_uppercase());
    }

    Ok(commands)
}

fn split_command(line: &str) -> (&str, &str) {
    let mut parts = line.splitn(2, char::is_whitespace);
    let name = parts.next().unwrap_or("");
    let args = parts.next().unwrap_or("").trim();
    (name, args)
}

fn unquote(s: &str) -> &str {
    if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') && !s.starts_with(r#"""""#) {
        &s[1..s.len() - 1]
    } else {
        s
    }
}
