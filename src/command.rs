use anyhow::{Context, Result};
use clap::builder::PossibleValuesParser;
use clap::{Arg, ArgAction, ArgMatches, Command};
use futures::future::BoxFuture;
use std::fmt::Display;
use std::str::FromStr;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use crate::config::Settings;

pub type Handler = fn(Invocation) -> BoxFuture<'static, Result<()>>;

pub enum Entry {
    Group {
        name: &'static str,
        entries: Vec<Entry>,
    },
    Leaf(LeafDef),
    Index(IndexDef),
}

pub struct LeafDef {
    pub name: &'static str,
    pub description: &'static str,
    pub options: Vec<OptionSpec>,
    pub handler: Handler,
}

#[derive(Default)]
pub struct IndexDef {
    pub description: &'static str,
    pub options: Vec<OptionSpec>,
    pub handler: Option<Handler>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArgKind {
    Required,
    Optional,
    Value,
    Repeated,
    Flag,
}

#[derive(Debug, Clone)]
pub struct OptionSpec {
    name: &'static str,
    help: &'static str,
    kind: ArgKind,
    short: Option<char>,
    choices: &'static [&'static str],
    default: Option<&'static str>,
}

impl OptionSpec {
    fn new(name: &'static str, help: &'static str, kind: ArgKind) -> Self {
        Self {
            name,
            help,
            kind,
            short: None,
            choices: &[],
            default: None,
        }
    }

    pub fn required(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, ArgKind::Required)
    }

    pub fn optional(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, ArgKind::Optional)
    }

    pub fn value(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, ArgKind::Value)
    }

    pub fn repeated(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, ArgKind::Repeated)
    }

    pub fn flag(name: &'static str, help: &'static str) -> Self {
        Self::new(name, help, ArgKind::Flag)
    }

    pub fn short(mut self, short: char) -> Self {
        self.short = Some(short);
        self
    }

    pub fn choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = choices;
        self
    }

    pub fn default_value(mut self, default: &'static str) -> Self {
        self.default = Some(default);
        self
    }

    pub fn is_positional(&self) -> bool {
        matches!(self.kind, ArgKind::Required | ArgKind::Optional)
    }

    fn to_arg(&self) -> Arg {
        let mut arg = Arg::new(self.name).help(self.help);
        arg = match self.kind {
            ArgKind::Required => arg.required(true),
            ArgKind::Optional => arg.required(false),
            ArgKind::Value => arg.long(self.name).num_args(1),
            ArgKind::Repeated => arg.long(self.name).action(ArgAction::Append),
            ArgKind::Flag => arg.long(self.name).action(ArgAction::SetTrue),
        };
        if let Some(short) = self.short {
            arg = arg.short(short);
        }
        if !self.choices.is_empty() {
            arg = arg.value_parser(PossibleValuesParser::new(self.choices.iter().copied()));
        }
        if let Some(default) = self.default {
            arg = arg.default_value(default);
        }
        arg
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AssemblyError {
    #[error("a command under `{parent}` has no name")]
    MissingName { parent: String },

    #[error("command `{path}` is defined more than once")]
    DuplicateName { path: String },

    #[error(
        "container command `{path}` has child commands so its own handler cannot take positional arguments"
    )]
    AmbiguousContainer { path: String },

    #[error("index entry found outside of a group")]
    OrphanIndex,

    #[error("no commands remain after pruning empty groups")]
    EmptyForest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Leaf,
    Container,
}

#[derive(Debug)]
struct Node {
    name: &'static str,
    description: &'static str,
    options: Vec<OptionSpec>,
    handler: Option<Handler>,
    kind: NodeKind,
    indexed: bool,
    parent: Option<usize>,
    children: Vec<usize>,
}

/// The assembled, read-only command tree. Nodes live in one arena and refer
/// to each other by index; pruned nodes stay in the arena but are unreachable.
#[derive(Debug, Default)]
pub struct CommandForest {
    nodes: Vec<Node>,
    roots: Vec<usize>,
}

pub struct Invocation {
    pub path: String,
    pub matches: ArgMatches,
    pub settings: Arc<Settings>,
}

impl Invocation {
    pub fn value(&self, name: &str) -> Option<&str> {
        self.matches
            .try_get_one::<String>(name)
            .ok()
            .flatten()
            .map(String::as_str)
    }

    pub fn required(&self, name: &str) -> Result<&str> {
        self.value(name)
            .with_context(|| format!("missing argument <{name}>"))
    }

    pub fn values(&self, name: &str) -> Vec<String> {
        self.matches
            .try_get_many::<String>(name)
            .ok()
            .flatten()
            .map(|values| values.cloned().collect())
            .unwrap_or_default()
    }

    pub fn flag(&self, name: &str) -> bool {
        self.matches
            .try_get_one::<bool>(name)
            .ok()
            .flatten()
            .copied()
            .unwrap_or(false)
    }

    pub fn parse<T>(&self, name: &str) -> Result<Option<T>>
    where
        T: FromStr,
        T::Err: Display,
    {
        self.value(name)
            .map(|raw| {
                raw.parse::<T>()
                    .map_err(|error| anyhow::anyhow!("invalid value {raw:?} for {name}: {error}"))
            })
            .transpose()
    }
}

/// Builds the forest from the manifest: merges groups of the same name,
/// prunes empty containers bottom-up and rejects ambiguous containers.
pub fn assemble(entries: Vec<Entry>) -> Result<CommandForest, AssemblyError> {
    let mut forest = CommandForest::default();
    for entry in entries {
        forest.insert(None, entry)?;
    }

    let roots = std::mem::take(&mut forest.roots);
    let kept = roots
        .into_iter()
        .filter(|&root| forest.prune(root))
        .collect();
    forest.roots = kept;
    if forest.roots.is_empty() {
        return Err(AssemblyError::EmptyForest);
    }

    forest.validate()?;
    debug!(roots = forest.roots.len(), nodes = forest.nodes.len(), "assembled command tree");
    Ok(forest)
}

impl CommandForest {
    fn insert(&mut self, parent: Option<usize>, entry: Entry) -> Result<(), AssemblyError> {
        match entry {
            Entry::Group { name, entries } => {
                self.ensure_named(parent, name)?;
                let container = match self.find_child(parent, name) {
                    Some(existing) if self.nodes[existing].kind == NodeKind::Container => existing,
                    Some(existing) => {
                        return Err(AssemblyError::DuplicateName {
                            path: self.path(existing),
                        });
                    }
                    None => self.push(parent, name, NodeKind::Container),
                };
                for entry in entries {
                    self.insert(Some(container), entry)?;
                }
            }
            Entry::Leaf(def) => {
                self.ensure_named(parent, def.name)?;
                if let Some(existing) = self.find_child(parent, def.name) {
                    return Err(AssemblyError::DuplicateName {
                        path: self.path(existing),
                    });
                }
                let leaf = self.push(parent, def.name, NodeKind::Leaf);
                let node = &mut self.nodes[leaf];
                node.description = def.description;
                node.options = def.options;
                node.handler = Some(def.handler);
            }
            Entry::Index(def) => {
                let container = parent.ok_or(AssemblyError::OrphanIndex)?;
                if self.nodes[container].indexed {
                    return Err(AssemblyError::DuplicateName {
                        path: self.path(container),
                    });
                }
                let node = &mut self.nodes[container];
                node.indexed = true;
                node.description = def.description;
                node.options = def.options;
                node.handler = def.handler;
            }
        }
        Ok(())
    }

    fn ensure_named(&self, parent: Option<usize>, name: &str) -> Result<(), AssemblyError> {
        if name.trim().is_empty() {
            return Err(AssemblyError::MissingName {
                parent: parent.map(|index| self.path(index)).unwrap_or_default(),
            });
        }
        Ok(())
    }

    fn push(&mut self, parent: Option<usize>, name: &'static str, kind: NodeKind) -> usize {
        let index = self.nodes.len();
        self.nodes.push(Node {
            name,
            description: "",
            options: Vec::new(),
            handler: None,
            kind,
            indexed: false,
            parent,
            children: Vec::new(),
        });
        match parent {
            Some(parent) => self.nodes[parent].children.push(index),
            None => self.roots.push(index),
        }
        index
    }

    fn find_child(&self, parent: Option<usize>, name: &str) -> Option<usize> {
        let siblings = match parent {
            Some(parent) => &self.nodes[parent].children,
            None => &self.roots,
        };
        siblings
            .iter()
            .copied()
            .find(|&index| self.nodes[index].name == name)
    }

    fn prune(&mut self, index: usize) -> bool {
        if self.nodes[index].kind == NodeKind::Leaf {
            return true;
        }
        let children = std::mem::take(&mut self.nodes[index].children);
        let kept = children
            .into_iter()
            .filter(|&child| self.prune(child))
            .collect::<Vec<_>>();
        let node = &mut self.nodes[index];
        node.children = kept;
        !node.children.is_empty() || node.handler.is_some()
    }

    fn validate(&self) -> Result<(), AssemblyError> {
        let mut pending = self.roots.clone();
        while let Some(index) = pending.pop() {
            let node = &self.nodes[index];
            if !node.children.is_empty()
                && node.handler.is_some()
                && node.options.iter().any(OptionSpec::is_positional)
            {
                return Err(AssemblyError::AmbiguousContainer {
                    path: self.path(index),
                });
            }
            pending.extend(node.children.iter().copied());
        }
        Ok(())
    }

    fn path(&self, index: usize) -> String {
        let mut names = vec![self.nodes[index].name];
        let mut current = self.nodes[index].parent;
        while let Some(parent) = current {
            names.push(self.nodes[parent].name);
            current = self.nodes[parent].parent;
        }
        names.reverse();
        names.join(" ")
    }

    pub fn root_names(&self) -> Vec<&'static str> {
        self.roots.iter().map(|&index| self.nodes[index].name).collect()
    }

    pub fn to_command(&self, root: Command) -> Command {
        self.roots
            .iter()
            .fold(root.subcommand_required(true), |command, &index| {
                command.subcommand(self.build(index))
            })
    }

    fn build(&self, index: usize) -> Command {
        let node = &self.nodes[index];
        let mut command = Command::new(node.name).about(node.description);
        for option in &node.options {
            command = command.arg(option.to_arg());
        }
        if !node.children.is_empty() {
            command = command.subcommand_required(node.handler.is_none());
            for &child in &node.children {
                command = command.subcommand(self.build(child));
            }
        }
        command
    }

    pub fn resolve<'a>(&self, matches: &'a ArgMatches) -> Option<(Handler, String, &'a ArgMatches)> {
        let (name, mut current_matches) = matches.subcommand()?;
        let mut current = self.find_child(None, name)?;
        while let Some((name, sub_matches)) = current_matches.subcommand() {
            current = self.find_child(Some(current), name)?;
            current_matches = sub_matches;
        }
        let handler = self.nodes[current].handler?;
        Some((handler, self.path(current), current_matches))
    }

    pub async fn dispatch(&self, matches: &ArgMatches, settings: Arc<Settings>) -> Result<()> {
        let (handler, path, matches) = self
            .resolve(matches)
            .context("no command handles these arguments")?;
        debug!(command = %path, "dispatching");
        handler(Invocation {
            path,
            matches: matches.clone(),
            settings,
        })
        .await
    }
}
