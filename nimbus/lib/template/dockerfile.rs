//! Single-stage Dockerfile support.
//!
//! A Dockerfile is translated into a [`TemplateSpec`]. Only one stage is supported: a second
//! `FROM`, a named stage or `COPY --from` are rejected while parsing, before any build starts.

use std::collections::HashMap;

use crate::{NimbusError, NimbusResult};

use super::{BuildStep, StartCommand, TemplateSpec};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Instructions accepted but without effect on the snapshot.
const IGNORED_INSTRUCTIONS: &[&str] = &[
    "ARG",
    "EXPOSE",
    "LABEL",
    "MAINTAINER",
    "VOLUME",
    "STOPSIGNAL",
    "HEALTHCHECK",
    "SHELL",
];

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

struct Instruction {
    line: usize,
    keyword: String,
    args: String,
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Parses a Dockerfile into a template spec.
///
/// `files` maps `COPY`/`ADD` source paths to their content since there is no build context
/// directory.
pub fn parse_dockerfile(
    dockerfile: &str,
    files: &HashMap<String, String>,
) -> NimbusResult<TemplateSpec> {
    let mut from: Option<String> = None;
    let mut steps = Vec::new();
    let mut entrypoint: Option<String> = None;
    let mut cmd: Option<String> = None;

    for Instruction {
        line,
        keyword,
        args,
    } in instructions(dockerfile)
    {
        let invalid = |message: String| NimbusError::InvalidDockerfile { line, message };

        if keyword == "FROM" {
            if from.is_some() {
                return Err(NimbusError::MultiStageBuildUnsupported(format!(
                    "second FROM at line {line}"
                )));
            }

            let words = split_words(&args).map_err(invalid)?;
            let words = words
                .iter()
                .filter(|w| !w.starts_with("--"))
                .collect::<Vec<_>>();
            match words.as_slice() {
                [image] => from = Some(image.to_string()),
                [_, as_kw, stage] if as_kw.eq_ignore_ascii_case("as") => {
                    return Err(NimbusError::MultiStageBuildUnsupported(format!(
                        "named stage {stage} at line {line}"
                    )));
                }
                _ => return Err(invalid(format!("malformed FROM: {args}"))),
            }
            continue;
        }

        if IGNORED_INSTRUCTIONS.contains(&keyword.as_str()) {
            continue;
        }

        if from.is_none() {
            return Err(invalid(format!("{keyword} before FROM")));
        }

        match keyword.as_str() {
            "RUN" => steps.push(BuildStep::Run {
                cmd: command_line(&args).map_err(invalid)?,
            }),
            "COPY" | "ADD" => steps.extend(copy_steps(&keyword, &args, files).map_err(|e| match e {
                CopyError::Stage(source) => NimbusError::MultiStageBuildUnsupported(format!(
                    "COPY --from={source} at line {line}"
                )),
                CopyError::Invalid(message) => invalid(message),
            })?),
            "ENV" => steps.extend(
                env_pairs(&args)
                    .map_err(invalid)?
                    .into_iter()
                    .map(|(key, value)| BuildStep::Env { key, value }),
            ),
            "WORKDIR" => steps.push(BuildStep::Workdir {
                path: single_arg(&args).map_err(invalid)?,
            }),
            "USER" => {
                let user = single_arg(&args).map_err(invalid)?;
                let name = user.split(':').next().unwrap_or_default().to_string();
                steps.push(BuildStep::User { name });
            }
            "CMD" => cmd = Some(command_line(&args).map_err(invalid)?),
            "ENTRYPOINT" => entrypoint = Some(command_line(&args).map_err(invalid)?),
            "ONBUILD" => return Err(invalid("ONBUILD is not supported".into())),
            other => return Err(invalid(format!("unknown instruction {other}"))),
        }
    }

    let from = from.ok_or_else(|| NimbusError::InvalidDockerfile {
        line: 0,
        message: "missing FROM".into(),
    })?;

    let start = match (entrypoint, cmd) {
        (Some(entrypoint), Some(cmd)) => Some(format!("{entrypoint} {cmd}")),
        (Some(only), None) | (None, Some(only)) => Some(only),
        (None, None) => None,
    }
    .map(|cmd| StartCommand { cmd, ready: None });

    Ok(TemplateSpec { from, steps, start })
}

/// Splits the file into instructions, joining continuation lines and dropping comments.
fn instructions(dockerfile: &str) -> Vec<Instruction> {
    let mut result = Vec::new();
    let mut pending: Option<(usize, String)> = None;

    for (index, raw) in dockerfile.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let (continues, content) = match trimmed.strip_suffix('\\') {
            Some(rest) => (true, rest.trim_end()),
            None => (false, trimmed),
        };

        let (start, mut text) = pending.take().unwrap_or((line_no, String::new()));
        if !text.is_empty() && !content.is_empty() {
            text.push(' ');
        }
        text.push_str(content);

        if continues {
            pending = Some((start, text));
        } else if !text.is_empty() {
            result.push(split_instruction(start, &text));
        }
    }

    if let Some((start, text)) = pending {
        if !text.is_empty() {
            result.push(split_instruction(start, &text));
        }
    }

    result
}

fn split_instruction(line: usize, text: &str) -> Instruction {
    let (keyword, args) = text.split_once(char::is_whitespace).unwrap_or((text, ""));
    Instruction {
        line,
        keyword: keyword.to_ascii_uppercase(),
        args: args.trim().to_string(),
    }
}

/// Exec form (`["a", "b"]`) is joined into a shell-quoted line; shell form is used as is.
fn command_line(args: &str) -> Result<String, String> {
    if args.is_empty() {
        return Err("missing command".into());
    }

    match exec_form(args) {
        Some(parts) if parts.is_empty() => Err("empty command".into()),
        Some(parts) => Ok(parts
            .iter()
            .map(|p| shell_quote(p))
            .collect::<Vec<_>>()
            .join(" ")),
        None => Ok(args.to_string()),
    }
}

fn exec_form(args: &str) -> Option<Vec<String>> {
    if !args.starts_with('[') {
        return None;
    }
    serde_json::from_str(args).ok()
}

enum CopyError {
    Stage(String),
    Invalid(String),
}

fn copy_steps(
    keyword: &str,
    args: &str,
    files: &HashMap<String, String>,
) -> Result<Vec<BuildStep>, CopyError> {
    let words = match exec_form(args) {
        Some(words) => words,
        None => split_words(args).map_err(CopyError::Invalid)?,
    };

    let mut paths = Vec::new();
    for word in words {
        if let Some(source) = word.strip_prefix("--from=") {
            return Err(CopyError::Stage(source.to_string()));
        }
        // --chown, --chmod and --link have no meaning without a build context.
        if !word.starts_with("--") {
            paths.push(word);
        }
    }

    let Some((dest, sources)) = paths.split_last() else {
        return Err(CopyError::Invalid(format!("{keyword} needs a source and a destination")));
    };
    if sources.is_empty() {
        return Err(CopyError::Invalid(format!("{keyword} needs a source and a destination")));
    }

    let into_dir = dest.ends_with('/') || sources.len() > 1;
    sources
        .iter()
        .map(|source| {
            if source.contains("://") {
                return Err(CopyError::Invalid(format!(
                    "remote sources are not supported: {source}"
                )));
            }

            let key = source.trim_start_matches("./");
            let content = files
                .get(key)
                .or_else(|| files.get(source.as_str()))
                .ok_or_else(|| CopyError::Invalid(format!("no content supplied for {source}")))?;

            let dest = if into_dir {
                let name = key.rsplit('/').next().unwrap_or(key);
                format!("{}/{name}", dest.trim_end_matches('/'))
            } else {
                dest.clone()
            };

            Ok(BuildStep::Copy {
                dest,
                content: content.clone(),
            })
        })
        .collect()
}

/// Parses `ENV key=value ...` and the legacy `ENV key value` form.
fn env_pairs(args: &str) -> Result<Vec<(String, String)>, String> {
    let Some(first) = args.split_whitespace().next() else {
        return Err("ENV needs a name and a value".into());
    };

    if !first.contains('=') {
        let (key, value) = args
            .split_once(char::is_whitespace)
            .ok_or_else(|| "ENV needs a name and a value".to_string())?;
        return Ok(vec![(key.to_string(), value.trim().to_string())]);
    }

    split_words(args)?
        .into_iter()
        .map(|word| {
            word.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| format!("expected name=value, found {word}"))
        })
        .collect()
}

fn single_arg(args: &str) -> Result<String, String> {
    let words = split_words(args)?;
    match words.as_slice() {
        [only] => Ok(only.clone()),
        _ => Err(format!("expected one argument, found {args:?}")),
    }
}

/// Splits on whitespace, honouring single quotes, double quotes and backslash escapes.
fn split_words(input: &str) -> Result<Vec<String>, String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut chars = input.chars();

    while let Some(c) = chars.next() {
        match c {
            '\'' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('\'') => break,
                        Some(c) => current.push(c),
                        None => return Err("unterminated single quote".into()),
                    }
                }
            }
            '"' => {
                in_word = true;
                loop {
                    match chars.next() {
                        Some('"') => break,
                        Some('\\') => match chars.next() {
                            Some(c) => current.push(c),
                            None => return Err("dangling escape".into()),
                        },
                        Some(c) => current.push(c),
                        None => return Err("unterminated double quote".into()),
                    }
                }
            }
            '\\' => {
                in_word = true;
                match chars.next() {
                    Some(c) => current.push(c),
                    None => return Err("dangling escape".into()),
                }
            }
            c if c.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            c => {
                in_word = true;
                current.push(c);
            }
        }
    }

    if in_word {
        words.push(current);
    }

    Ok(words)
}

fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "_-./=:@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
