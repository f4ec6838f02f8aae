//! Packet filter management via `iptables`

use super::exec::Tool;
use super::Outcome;
use netplane_common::{Error, Result};
use tracing::debug;

/// Packet-filter rule management. A rule is an ordered list of arguments as
/// passed to `iptables` after the chain name.
pub trait PacketFilter: Send + Sync {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool>;

    fn new_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Remove every rule from the chain
    fn flush_chain(&self, table: &str, chain: &str) -> Result<()>;

    /// Delete an empty, unreferenced chain
    fn delete_chain(&self, table: &str, chain: &str) -> Result<()>;

    fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool>;

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;

    /// Insert at a 1-based position
    fn insert(&self, table: &str, chain: &str, position: usize, rule: &[String]) -> Result<()>;

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()>;

    /// Rules in the chain in evaluation order, without the chain declaration
    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>>;

    fn rule_count(&self, table: &str, chain: &str) -> Result<usize> {
        Ok(self.list_rules(table, chain)?.len())
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &[String]) -> Result<Outcome> {
        if self.rule_exists(table, chain, rule)? {
            return Ok(Outcome::Unchanged);
        }
        self.append(table, chain, rule)?;
        Ok(Outcome::Changed)
    }

    fn insert_unique(
        &self,
        table: &str,
        chain: &str,
        position: usize,
        rule: &[String],
    ) -> Result<Outcome> {
        if self.rule_exists(table, chain, rule)? {
            return Ok(Outcome::Unchanged);
        }
        self.insert(table, chain, position, rule)?;
        Ok(Outcome::Changed)
    }

    fn delete_if_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<Outcome> {
        if !self.rule_exists(table, chain, rule)? {
            return Ok(Outcome::Unchanged);
        }
        self.delete(table, chain, rule)?;
        Ok(Outcome::Changed)
    }
}

/// `iptables` CLI backend. Every call waits on the xtables lock (`-w`).
pub struct Iptables {
    tool: Tool,
}

impl Iptables {
    pub fn new(program: &str) -> Self {
        Self {
            tool: Tool::new(program),
        }
    }

    fn command<'a>(table: &'a str, op: &'a str, chain: &'a str) -> Vec<&'a str> {
        vec!["-w", "-t", table, op, chain]
    }
}

impl PacketFilter for Iptables {
    fn chain_exists(&self, table: &str, chain: &str) -> Result<bool> {
        let args = Self::command(table, "-S", chain);
        let output = self.tool.run(&args)?;
        // Exit status 1 is "no chain by that name"; anything else is a real failure
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::external(
                format!("iptables -t {} -S {}", table, chain),
                output.stderr,
            )),
        }
    }

    fn new_chain(&self, table: &str, chain: &str) -> Result<()> {
        debug!("Creating chain {}/{}", table, chain);
        self.tool.run_checked(&Self::command(table, "-N", chain))?;
        Ok(())
    }

    fn flush_chain(&self, table: &str, chain: &str) -> Result<()> {
        debug!("Flushing chain {}/{}", table, chain);
        self.tool.run_checked(&Self::command(table, "-F", chain))?;
        Ok(())
    }

    fn delete_chain(&self, table: &str, chain: &str) -> Result<()> {
        debug!("Deleting chain {}/{}", table, chain);
        self.tool.run_checked(&Self::command(table, "-X", chain))?;
        Ok(())
    }

    fn rule_exists(&self, table: &str, chain: &str, rule: &[String]) -> Result<bool> {
        let mut args = Self::command(table, "-C", chain);
        args.extend(rule.iter().map(String::as_str));
        let output = self.tool.run(&args)?;
        match output.code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(Error::external(
                format!("iptables -t {} -C {} {}", table, chain, rule.join(" ")),
                output.stderr,
            )),
        }
    }

    fn append(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = Self::command(table, "-A", chain);
        args.extend(rule.iter().map(String::as_str));
        self.tool.run_checked(&args)?;
        Ok(())
    }

    fn insert(&self, table: &str, chain: &str, position: usize, rule: &[String]) -> Result<()> {
        let position = position.to_string();
        let mut args = Self::command(table, "-I", chain);
        args.push(&position);
        args.extend(rule.iter().map(String::as_str));
        self.tool.run_checked(&args)?;
        Ok(())
    }

    fn delete(&self, table: &str, chain: &str, rule: &[String]) -> Result<()> {
        let mut args = Self::command(table, "-D", chain);
        args.extend(rule.iter().map(String::as_str));
        self.tool.run_checked(&args)?;
        Ok(())
    }

    fn list_rules(&self, table: &str, chain: &str) -> Result<Vec<Vec<String>>> {
        let stdout = self.tool.run_checked(&Self::command(table, "-S", chain))?;
        Ok(parse_rule_listing(&stdout, chain))
    }
}

/// Parse `iptables -S CHAIN` output into rule argument lists. The `-N`/`-P`
/// declaration line is dropped and the leading `-A CHAIN` stripped.
pub fn parse_rule_listing(listing: &str, chain: &str) -> Vec<Vec<String>> {
    listing
        .lines()
        .filter_map(|line| {
            let words = split_words(line);
            match words.as_slice() {
                [op, name, rest @ ..] if op == "-A" && name == chain => Some(rest.to_vec()),
                _ => None,
            }
        })
        .collect()
}

/// Split a listing line the way `iptables-save` quotes it
fn split_words(line: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    let mut chars = line.trim().chars();
    while let Some(c) = chars.next() {
        match c {
            '"' => quoted = !quoted,
            '\\' if quoted => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            c if c.is_whitespace() && !quoted => {
                if !current.is_empty() {
                    words.push(std::mem::take(&mut current));
                }
            }
            c => current.push(c),
        }
    }
    if !current.is_empty() {
        words.push(current);
    }
    words
}
