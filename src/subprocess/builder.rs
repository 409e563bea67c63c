use std::collections::BTreeMap;
use std::path::Path;

use super::launcher::LaunchSpec;

/// Split a chat command into arguments: whitespace tokens, empty tokens
/// dropped, then `--resume` when resuming a previous conversation.
pub fn chat_args(command: &str, resume: bool) -> Vec<String> {
    let mut args: Vec<String> = command.split_whitespace().map(str::to_string).collect();
    if resume {
        args.push("--resume".to_string());
    }
    args
}

pub struct LaunchSpecBuilder {
    spec: LaunchSpec,
}

impl LaunchSpecBuilder {
    pub fn new(program: &str) -> Self {
        Self {
            spec: LaunchSpec {
                program: program.to_string(),
                args: Vec::new(),
                env: BTreeMap::new(),
                working_dir: None,
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.spec.args.push(arg.to_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.spec
            .args
            .extend(args.into_iter().map(|s| s.as_ref().to_string()));
        self
    }

    pub fn env(mut self, key: &str, value: &str) -> Self {
        self.spec.env.insert(key.to_string(), value.to_string());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            self.spec
                .env
                .insert(key.as_ref().to_string(), value.as_ref().to_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: &Path) -> Self {
        self.spec.working_dir = Some(dir.to_path_buf());
        self
    }

    pub fn build(self) -> LaunchSpec {
        self.spec
    }
}
