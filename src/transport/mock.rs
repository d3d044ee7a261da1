use std::collections::VecDeque;
use std::io::{self, IoSlice};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::Transport;
use crate::buf::File;

/// Scripted outcome of the next send call.
#[derive(Debug, Clone, Copy)]
pub(crate) enum Step {
    /// Accept at most `n` bytes.
    Accept(usize),
    WouldBlock,
    Fail,
}

/// Recording transport, clones share state.
#[derive(Debug, Clone, Default)]
pub(crate) struct Mock {
    state: Arc<Mutex<State>>,
}

#[derive(Debug, Default)]
pub(crate) struct State {
    pub(crate) written: Vec<u8>,
    pub(crate) script: VecDeque<Step>,
    pub(crate) calls: Vec<usize>,
    pub(crate) timer: Option<Duration>,
    pub(crate) timers: Vec<Duration>,
}

impl Mock {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub(crate) fn script(&self, steps: impl IntoIterator<Item = Step>) {
        self.state().script.extend(steps);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.state().written.clone()
    }

    pub(crate) fn written_str(&self) -> String {
        String::from_utf8(self.written()).unwrap()
    }

    /// Response body after the head.
    pub(crate) fn body(&self) -> String {
        let all = self.written_str();
        match all.split_once("\r\n\r\n") {
            Some((_, body)) => body.to_string(),
            None => all,
        }
    }

    fn accept(&self, available: usize) -> io::Result<usize> {
        let mut state = self.state();
        let n = match state.script.pop_front() {
            None => available,
            Some(Step::Accept(n)) => n.min(available),
            Some(Step::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
            Some(Step::Fail) => return Err(io::ErrorKind::BrokenPipe.into()),
        };
        state.calls.push(n);
        Ok(n)
    }
}

impl Transport for Mock {
    fn send(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let total = bufs.iter().map(|b| b.len()).sum();
        let n = self.accept(total)?;

        let mut state = self.state();
        let mut left = n;
        for buf in bufs {
            let take = left.min(buf.len());
            state.written.extend_from_slice(&buf[..take]);
            left -= take;
        }
        Ok(n)
    }

    fn send_file(&mut self, file: &File, offset: u64, len: u64) -> io::Result<usize> {
        let n = self.accept(len as usize)?;
        let mut data = vec![0; n];
        file.read_exact_at(&mut data, offset)?;
        self.state().written.extend_from_slice(&data);
        Ok(n)
    }

    fn add_timer(&mut self, delay: Duration) {
        let mut state = self.state();
        state.timer = Some(delay);
        state.timers.push(delay);
    }

    fn del_timer(&mut self) {
        self.state().timer = None;
    }
}
