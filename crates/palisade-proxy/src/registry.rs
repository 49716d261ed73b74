use std::time::Duration;

use anyhow::Error;
use mio::{event::Source, Events, Interest, Poll, Token};

/// Thin wrapper over the mio poll, owning token allocation.
///
/// Owned by the reactor thread; nothing here is shared.
pub(crate) struct Registry {
    poll: Poll,
    next_token: usize,
}

impl Registry {
    pub fn new() -> Result<Self, Error> {
        Ok(Self {
            poll: Poll::new()?,
            next_token: 0,
        })
    }

    /// Create a new unique token for this registry.
    pub fn token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    pub fn poll(&mut self, events: &mut Events, timeout: Option<Duration>) -> Result<(), Error> {
        match self.poll.poll(events, timeout) {
            Ok(()) => Ok(()),
            // A signal landed mid-wait; the events batch is simply empty
            Err(error) if error.kind() == std::io::ErrorKind::Interrupted => Ok(()),
            Err(error) => Err(error.into()),
        }
    }

    pub fn register<S>(&self, source: &mut S, token: Token, interest: Interest) -> Result<(), Error>
    where
        S: Source,
    {
        self.poll.registry().register(source, token, interest)?;
        Ok(())
    }

    pub fn reregister<S>(
        &self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> Result<(), Error>
    where
        S: Source,
    {
        self.poll.registry().reregister(source, token, interest)?;
        Ok(())
    }

    pub fn deregister<S>(&self, source: &mut S) -> Result<(), Error>
    where
        S: Source,
    {
        self.poll.registry().deregister(source)?;
        Ok(())
    }
}
