use anyhow::{bail, Result};

use crate::api::{GenerateRequest, Message};
use crate::models::Model;
use crate::session::Loaded;

#[derive(Debug, thiserror::Error)]
#[error("invalid role {0:?}, role must be one of [system, user, assistant]")]
pub struct InvalidRole(pub String);

/// Variable bindings a model template is evaluated against.
#[derive(Debug, Clone, Default)]
pub struct PromptVars {
    pub first: bool,
    pub system: String,
    pub prompt: String,
}

impl Model {
    /// Evaluates this model's template. An empty `vars.system` falls back to
    /// the model's default system message.
    pub fn prompt(&self, vars: &PromptVars) -> Result<String> {
        let template = Template::parse(&self.template)?;

        let mut resolved = vars.clone();
        if resolved.system.is_empty() {
            resolved.system = self.system.clone();
        }

        template.execute(&resolved)
    }
}

/// Builds the prompt for a generate request: decode the legacy `context`
/// vector back to text through the live backend, then append one template
/// expansion.
pub async fn from_request_params(loaded: &mut Loaded, model: &Model, req: &GenerateRequest) -> Result<String> {
    let mut model = model.clone();
    if !req.template.is_empty() {
        model.template = req.template.clone();
    }

    let mut prompt = String::new();
    if !req.context.is_empty() {
        let runner = match loaded.runner.as_mut() {
            Some(r) => r,
            None => bail!("no model loaded"),
        };
        let prev = runner.decode(&req.context).await?;
        prompt.push_str(prev.strip_prefix(' ').unwrap_or(&prev));
    }

    let vars = PromptVars {
        first: req.context.is_empty(),
        system: req.system.clone(),
        prompt: req.prompt.clone(),
    };
    prompt.push_str(&model.prompt(&vars)?);
    Ok(prompt)
}

/// Builds the prompt for a chat request by walking the message history. Each
/// flush expands the template over the pending system+user pair, so a
/// `[system, user, assistant]` turn costs exactly one expansion.
pub fn from_messages(model: &Model, messages: &[Message]) -> Result<String> {
    let mut prompt = String::new();
    let mut vars = PromptVars::default();

    let mut flush = |vars: &mut PromptVars, prompt: &mut String| -> Result<()> {
        vars.first = prompt.is_empty();
        prompt.push_str(&model.prompt(vars)?);
        vars.system.clear();
        vars.prompt.clear();
        Ok(())
    };

    for message in messages {
        if (message.role == "system" || message.role == "user") && !vars.prompt.is_empty() {
            flush(&mut vars, &mut prompt)?;
        }

        if message.role == "assistant" && (!vars.prompt.is_empty() || !vars.system.is_empty()) {
            flush(&mut vars, &mut prompt)?;
        }

        match message.role.as_str() {
            "system" => vars.system = message.content.clone(),
            "user" => vars.prompt = message.content.clone(),
            "assistant" => prompt.push_str(&message.content),
            other => bail!(InvalidRole(other.to_string())),
        }
    }

    if !vars.prompt.is_empty() || !vars.system.is_empty() {
        flush(&mut vars, &mut prompt)?;
    }

    Ok(prompt)
}

/// Minimal template language: literal text, `{{ .Var }}` substitution and
/// `{{ if .Var }}...{{ else }}...{{ end }}`, with `{{-`/`-}}` whitespace
/// trimming. Model templates are untrusted input, so this is all there is:
/// no functions, no file access, no recursion.
#[derive(Debug)]
pub struct Template {
    nodes: Vec<Node>,
}

#[derive(Debug)]
enum Node {
    Text(String),
    Var(String),
    If {
        var: String,
        then: Vec<Node>,
        otherwise: Vec<Node>,
    },
}

#[derive(Debug)]
enum Token {
    Text(String),
    Action(String),
}

impl Template {
    pub fn parse(src: &str) -> Result<Template> {
        let tokens = tokenize(src)?;
        let mut pos = 0;
        let (nodes, terminator) = parse_nodes(&tokens, &mut pos)?;
        if terminator.is_some() {
            bail!("unexpected {{{{ end }}}} in template");
        }
        Ok(Template { nodes })
    }

    pub fn execute(&self, vars: &PromptVars) -> Result<String> {
        let mut out = String::new();
        execute_nodes(&self.nodes, vars, &mut out)?;
        Ok(out)
    }
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let mut tokens = Vec::new();
    let mut rest = src;
    let mut trim_next_text = false;

    while let Some(start) = rest.find("{{") {
        let mut text = &rest[..start];
        let after = &rest[start + 2..];

        let end = match after.find("}}") {
            Some(e) => e,
            None => bail!("unterminated template action"),
        };
        let mut action = &after[..end];
        rest = &after[end + 2..];

        if let Some(stripped) = action.strip_prefix('-') {
            action = stripped;
            text = text.trim_end();
        }
        let mut trim_after = false;
        if let Some(stripped) = action.strip_suffix('-') {
            action = stripped;
            trim_after = true;
        }

        let text = if trim_next_text { text.trim_start() } else { text };
        if !text.is_empty() {
            tokens.push(Token::Text(text.to_string()));
        }
        tokens.push(Token::Action(action.trim().to_string()));
        trim_next_text = trim_after;
    }

    let tail = if trim_next_text { rest.trim_start() } else { rest };
    if !tail.is_empty() {
        tokens.push(Token::Text(tail.to_string()));
    }

    Ok(tokens)
}

// "end" and "else" bubble back up to the enclosing if
enum Terminator {
    End,
    Else,
}

fn parse_nodes(tokens: &[Token], pos: &mut usize) -> Result<(Vec<Node>, Option<Terminator>)> {
    let mut nodes = Vec::new();

    while *pos < tokens.len() {
        match &tokens[*pos] {
            Token::Text(text) => {
                nodes.push(Node::Text(text.clone()));
                *pos += 1;
            }
            Token::Action(action) => {
                *pos += 1;
                if action == "end" {
                    return Ok((nodes, Some(Terminator::End)));
                }
                if action == "else" {
                    return Ok((nodes, Some(Terminator::Else)));
                }

                if let Some(cond) = action.strip_prefix("if ") {
                    let var = parse_var(cond.trim())?;
                    let (then, term) = parse_nodes(tokens, pos)?;
                    let (otherwise, term) = match term {
                        Some(Terminator::Else) => {
                            let (otherwise, term) = parse_nodes(tokens, pos)?;
                            (otherwise, term)
                        }
                        other => (Vec::new(), other),
                    };
                    if !matches!(term, Some(Terminator::End)) {
                        bail!("missing {{{{ end }}}} in template");
                    }
                    nodes.push(Node::If { var, then, otherwise });
                    continue;
                }

                nodes.push(Node::Var(parse_var(action)?));
            }
        }
    }

    Ok((nodes, None))
}

fn parse_var(action: &str) -> Result<String> {
    match action.strip_prefix('.') {
        Some(name) if !name.is_empty() && name.chars().all(char::is_alphanumeric) => Ok(name.to_string()),
        _ => bail!("unsupported template action {:?}", action),
    }
}

fn execute_nodes(nodes: &[Node], vars: &PromptVars, out: &mut String) -> Result<()> {
    for node in nodes {
        match node {
            Node::Text(text) => out.push_str(text),
            Node::Var(name) => out.push_str(&lookup(name, vars)?),
            Node::If { var, then, otherwise } => {
                if truthy(var, vars)? {
                    execute_nodes(then, vars, out)?;
                } else {
                    execute_nodes(otherwise, vars, out)?;
                }
            }
        }
    }
    Ok(())
}

fn lookup(name: &str, vars: &PromptVars) -> Result<String> {
    Ok(match name {
        "First" => vars.first.to_string(),
        "System" => vars.system.clone(),
        "Prompt" => vars.prompt.clone(),
        _ => bail!("unknown template variable .{}", name),
    })
}

fn truthy(name: &str, vars: &PromptVars) -> Result<bool> {
    Ok(match name {
        "First" => vars.first,
        "System" => !vars.system.is_empty(),
        "Prompt" => !vars.prompt.is_empty(),
        _ => bail!("unknown template variable .{}", name),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model_with(template: &str, system: &str) -> Model {
        Model {
            template: template.to_string(),
            system: system.to_string(),
            ..Default::default()
        }
    }

    fn msg(role: &str, content: &str) -> Message {
        Message { role: role.to_string(), content: content.to_string() }
    }

    #[test]
    fn substitutes_variables() {
        let t = Template::parse("[INST] {{ .System }} {{ .Prompt }} [/INST]").unwrap();
        let out = t
            .execute(&PromptVars {
                first: true,
                system: "be kind".to_string(),
                prompt: "hello".to_string(),
            })
            .unwrap();
        assert_eq!(out, "[INST] be kind hello [/INST]");
    }

    #[test]
    fn conditionals_and_trim_markers() {
        let t = Template::parse("{{- if .System }}<<SYS>>{{ .System }}<</SYS>>\n{{ end }}{{ .Prompt }}").unwrap();

        let with_system = t
            .execute(&PromptVars { first: false, system: "sys".to_string(), prompt: "p".to_string() })
            .unwrap();
        assert_eq!(with_system, "<<SYS>>sys<</SYS>>\np");

        let without = t
            .execute(&PromptVars { first: false, system: String::new(), prompt: "p".to_string() })
            .unwrap();
        assert_eq!(without, "p");
    }

    #[test]
    fn else_branch() {
        let t = Template::parse("{{ if .First }}START{{ else }}CONT{{ end }}").unwrap();
        assert_eq!(t.execute(&PromptVars { first: true, ..Default::default() }).unwrap(), "START");
        assert_eq!(t.execute(&PromptVars { first: false, ..Default::default() }).unwrap(), "CONT");
    }

    #[test]
    fn rejects_dangerous_actions() {
        assert!(Template::parse("{{ call .Something }}").is_err());
        assert!(Template::parse("{{ .System.Inner }}").is_err());
        assert!(Template::parse("{{ if .System }}unclosed").is_err());
    }

    #[test]
    fn model_system_is_the_default() {
        let model = model_with("{{ .System }}|{{ .Prompt }}", "default sys");

        let out = model
            .prompt(&PromptVars { first: true, system: String::new(), prompt: "q".to_string() })
            .unwrap();
        assert_eq!(out, "default sys|q");

        let out = model
            .prompt(&PromptVars { first: true, system: "override".to_string(), prompt: "q".to_string() })
            .unwrap();
        assert_eq!(out, "override|q");
    }

    #[test]
    fn chat_flushes_once_per_turn() {
        // a template whose expansions are countable
        let model = model_with("<T>", "");

        let mut messages = Vec::new();
        for i in 0..3 {
            messages.push(msg("system", &format!("sys{}", i)));
            messages.push(msg("user", &format!("q{}", i)));
            messages.push(msg("assistant", &format!("a{}", i)));
        }

        let prompt = from_messages(&model, &messages).unwrap();
        assert_eq!(prompt.matches("<T>").count(), 3);
        assert_eq!(prompt, "<T>a0<T>a1<T>a2");
    }

    #[test]
    fn trailing_pair_is_flushed() {
        let model = model_with("({{ .System }}/{{ .Prompt }})", "");
        let prompt = from_messages(
            &model,
            &[msg("system", "s"), msg("user", "u")],
        )
        .unwrap();
        assert_eq!(prompt, "(s/u)");
    }

    #[test]
    fn consecutive_user_messages_flush_between() {
        let model = model_with("[{{ .Prompt }}]", "");
        let prompt = from_messages(&model, &[msg("user", "one"), msg("user", "two")]).unwrap();
        assert_eq!(prompt, "[one][two]");
    }

    #[test]
    fn unknown_role_fails() {
        let model = model_with("{{ .Prompt }}", "");
        let err = from_messages(&model, &[msg("tool", "x")]).unwrap_err();
        assert!(err.downcast_ref::<InvalidRole>().is_some());
    }
}
