use std::collections::VecDeque;
use std::io::{self, BufRead, Write};

/// Source of interactive answers.
pub trait Prompter {
    /// Shows `message` and returns the answer with all whitespace removed.
    fn ask(&mut self, message: &str) -> io::Result<String>;
}

/// Reads answers from the terminal.
#[derive(Debug, Default)]
pub struct TerminalPrompter;

impl Prompter for TerminalPrompter {
    fn ask(&mut self, message: &str) -> io::Result<String> {
        print!("{message}: ");
        io::stdout().flush()?;

        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        println!();

        Ok(strip_whitespace(&line))
    }
}

/// Replays a fixed list of answers, used by tests and non-interactive runs.
#[derive(Debug, Default)]
pub struct ScriptedPrompter {
    answers: VecDeque<String>,
    pub asked: Vec<String>,
}

impl ScriptedPrompter {
    pub fn new<I, S>(answers: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            answers: answers.into_iter().map(Into::into).collect(),
            asked: Vec::new(),
        }
    }
}

impl Prompter for ScriptedPrompter {
    fn ask(&mut self, message: &str) -> io::Result<String> {
        self.asked.push(message.to_string());
        self.answers
            .pop_front()
            .map(|answer| strip_whitespace(&answer))
            .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no scripted answer left"))
    }
}

fn strip_whitespace(raw: &str) -> String {
    raw.chars().filter(|c| !c.is_whitespace()).collect()
}
