use std::fmt;
use std::str::FromStr;

/// Signals the process manager knows how to deliver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum Signal {
    /// SIGHUP - hang up, commonly "reload"
    Hup,
    /// SIGINT - interrupt (Ctrl+C equivalent)
    Int,
    /// SIGQUIT
    Quit,
    /// SIGKILL - immediate termination, cannot be caught
    Kill,
    Usr1,
    Usr2,
    /// SIGTERM - allows graceful shutdown
    #[default]
    Term,
    Cont,
    Stop,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown signal `{0}`")]
pub struct SignalParseError(pub String);

impl Signal {
    pub const ALL: [Signal; 9] = [
        Signal::Hup,
        Signal::Int,
        Signal::Quit,
        Signal::Kill,
        Signal::Usr1,
        Signal::Usr2,
        Signal::Term,
        Signal::Cont,
        Signal::Stop,
    ];

    /// Name without the `SIG` prefix, as `kill -l` prints it.
    pub const fn name(self) -> &'static str {
        match self {
            Signal::Hup => "HUP",
            Signal::Int => "INT",
            Signal::Quit => "QUIT",
            Signal::Kill => "KILL",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
            Signal::Term => "TERM",
            Signal::Cont => "CONT",
            Signal::Stop => "STOP",
        }
    }

    /// Platform signal number.
    pub fn number(self) -> i32 {
        self.as_nix() as i32
    }

    pub(crate) fn as_nix(self) -> nix::sys::signal::Signal {
        use nix::sys::signal::Signal as Nix;
        match self {
            Signal::Hup => Nix::SIGHUP,
            Signal::Int => Nix::SIGINT,
            Signal::Quit => Nix::SIGQUIT,
            Signal::Kill => Nix::SIGKILL,
            Signal::Usr1 => Nix::SIGUSR1,
            Signal::Usr2 => Nix::SIGUSR2,
            Signal::Term => Nix::SIGTERM,
            Signal::Cont => Nix::SIGCONT,
            Signal::Stop => Nix::SIGSTOP,
        }
    }

    /// Signals whose default action ends the process.
    pub const fn is_terminating(self) -> bool {
        matches!(
            self,
            Signal::Hup | Signal::Int | Signal::Quit | Signal::Kill | Signal::Term
        )
    }

    /// Map a raw signal number (e.g. from a wait status) back to a known signal.
    pub fn from_number(number: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|signal| signal.number() == number)
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Signal {
    type Err = SignalParseError;

    /// Accepts `TERM`, `SIGTERM`, `term` and numeric forms such as `15`.
    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let trimmed = raw.trim();
        if let Ok(number) = trimmed.parse::<i32>() {
            return Self::from_number(number).ok_or_else(|| SignalParseError(raw.to_string()));
        }

        let upper = trimmed.to_ascii_uppercase();
        let name = upper.strip_prefix("SIG").unwrap_or(&upper);
        Self::ALL
            .into_iter()
            .find(|signal| signal.name() == name)
            .ok_or_else(|| SignalParseError(raw.to_string()))
    }
}
