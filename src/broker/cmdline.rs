// SPDX-License-Identifier: MIT

//! Command line and environment encoding for the spawn service.
//!
//! The engine takes a single command line string, which the target splits
//! again with the usual Windows rules.  See "Everyone quotes command line
//! arguments the wrong way":
//!   https://learn.microsoft.com/en-us/archive/blogs/twistylittlepassagesallalike/everyone-quotes-command-line-arguments-the-wrong-way
//!
//! The program name is included as the first argument.

use crate::error::BrokerError;

/// Quote the program and its arguments into one command line.
pub fn quote_command_line(program: &str, args: &[String]) -> Result<String, BrokerError> {
    let mut ret = String::new();
    append_arg(&mut ret, program)?;
    for arg in args {
        ret.push(' ');
        append_arg(&mut ret, arg)?;
    }
    Ok(ret)
}

fn append_arg(cmd: &mut String, arg: &str) -> Result<(), BrokerError> {
    reject_nul(arg)?;
    if !requires_quoting(arg) {
        cmd.push_str(arg);
        return Ok(());
    }

    cmd.push('"');
    let mut backslashes = 0usize;
    for c in arg.chars() {
        match c {
            '\\' => {
                backslashes += 1;
                continue;
            }
            '"' => {
                // escape the run of backslashes, plus one for the quote.
                push_backslashes(cmd, backslashes * 2 + 1);
            }
            _ => push_backslashes(cmd, backslashes),
        }
        cmd.push(c);
        backslashes = 0;
    }
    // trailing backslashes precede the closing quote.
    push_backslashes(cmd, backslashes * 2);
    cmd.push('"');
    Ok(())
}

fn push_backslashes(cmd: &mut String, count: usize) {
    cmd.extend(std::iter::repeat_n('\\', count));
}

fn reject_nul(val: &str) -> Result<(), BrokerError> {
    if val.contains('\0') {
        Err(BrokerError::InvalidArgument(format!("nul byte found in {val:?}")))
    } else {
        Ok(())
    }
}

fn requires_quoting(val: &str) -> bool {
    val.is_empty() || val.chars().any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"'))
}

/// Environment for the target, sorted case-insensitively by name as the
/// Windows environment block requires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Environment {
    vars: Vec<(String, String)>,
}

impl Environment {
    /// Later duplicates of a name (ignoring case) replace earlier ones.
    pub fn new<I, K, V>(vars: I) -> Result<Self, BrokerError>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut sorted: Vec<(String, String)> = Vec::new();
        for (k, v) in vars {
            let (k, v) = (k.into(), v.into());
            reject_nul(&k)?;
            reject_nul(&v)?;
            match sorted.iter_mut().find(|(existing, _)| existing.eq_ignore_ascii_case(&k)) {
                Some(slot) => *slot = (k, v),
                None => sorted.push((k, v)),
            }
        }
        sorted.sort_by_key(|(k, _)| k.to_lowercase());
        Ok(Self { vars: sorted })
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn vars(&self) -> &[(String, String)] {
        &self.vars
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    /// `NAME=value` entries each ending in NUL, with a final NUL ending the
    /// block.  An empty environment is two NULs.
    pub fn to_block(&self) -> Vec<u16> {
        if self.vars.is_empty() {
            return vec![0, 0];
        }
        let mut block = Vec::new();
        for (k, v) in &self.vars {
            block.extend(k.encode_utf16());
            block.push('=' as u16);
            block.extend(v.encode_utf16());
            block.push(0);
        }
        block.push(0);
        block
    }
}
