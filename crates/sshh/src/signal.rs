//! POSIX signal names as listed in RFC 4254 section 6.10.

use russh::Sig;

/// A signal sent by the client over a session channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Abrt,
    Alrm,
    Fpe,
    Hup,
    Ill,
    Int,
    Kill,
    Pipe,
    Quit,
    Segv,
    Term,
    Usr1,
    Usr2,
}

impl Signal {
    /// Returns the RFC 4254 short name (without the `SIG` prefix).
    pub fn name(&self) -> &'static str {
        match self {
            Signal::Abrt => "ABRT",
            Signal::Alrm => "ALRM",
            Signal::Fpe => "FPE",
            Signal::Hup => "HUP",
            Signal::Ill => "ILL",
            Signal::Int => "INT",
            Signal::Kill => "KILL",
            Signal::Pipe => "PIPE",
            Signal::Quit => "QUIT",
            Signal::Segv => "SEGV",
            Signal::Term => "TERM",
            Signal::Usr1 => "USR1",
            Signal::Usr2 => "USR2",
        }
    }

    /// Parses an RFC 4254 short name. Unknown names yield `None`.
    pub fn from_name(name: &str) -> Option<Signal> {
        match name {
            "ABRT" => Some(Signal::Abrt),
            "ALRM" => Some(Signal::Alrm),
            "FPE" => Some(Signal::Fpe),
            "HUP" => Some(Signal::Hup),
            "ILL" => Some(Signal::Ill),
            "INT" => Some(Signal::Int),
            "KILL" => Some(Signal::Kill),
            "PIPE" => Some(Signal::Pipe),
            "QUIT" => Some(Signal::Quit),
            "SEGV" => Some(Signal::Segv),
            "TERM" => Some(Signal::Term),
            "USR1" => Some(Signal::Usr1),
            "USR2" => Some(Signal::Usr2),
            _ => None,
        }
    }

    /// Converts the transport-level signal. The transport has no dedicated
    /// USR2 variant and delivers it as a custom name, so custom names go
    /// through [`Signal::from_name`]. Unknown signals yield `None` and are
    /// dropped by the session request loop.
    pub(crate) fn from_sig(sig: &Sig) -> Option<Signal> {
        match sig {
            Sig::ABRT => Some(Signal::Abrt),
            Sig::ALRM => Some(Signal::Alrm),
            Sig::FPE => Some(Signal::Fpe),
            Sig::HUP => Some(Signal::Hup),
            Sig::ILL => Some(Signal::Ill),
            Sig::INT => Some(Signal::Int),
            Sig::KILL => Some(Signal::Kill),
            Sig::PIPE => Some(Signal::Pipe),
            Sig::QUIT => Some(Signal::Quit),
            Sig::SEGV => Some(Signal::Segv),
            Sig::TERM => Some(Signal::Term),
            Sig::USR1 => Some(Signal::Usr1),
            Sig::Custom(name) => Signal::from_name(name),
        }
    }
}

impl std::fmt::Display for Signal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_round_trip() {
        let all = [
            Signal::Abrt,
            Signal::Alrm,
            Signal::Fpe,
            Signal::Hup,
            Signal::Ill,
            Signal::Int,
            Signal::Kill,
            Signal::Pipe,
            Signal::Quit,
            Signal::Segv,
            Signal::Term,
            Signal::Usr1,
            Signal::Usr2,
        ];
        for sig in all {
            assert_eq!(Signal::from_name(sig.name()), Some(sig));
        }
    }

    #[test]
    fn test_unknown_name() {
        assert_eq!(Signal::from_name("WINCH"), None);
        assert_eq!(Signal::from_name(""), None);
    }

    #[test]
    fn test_from_transport_signal() {
        assert_eq!(Signal::from_sig(&Sig::INT), Some(Signal::Int));
        assert_eq!(Signal::from_sig(&Sig::TERM), Some(Signal::Term));
        assert_eq!(
            Signal::from_sig(&Sig::Custom("USR2".to_string())),
            Some(Signal::Usr2)
        );
        assert_eq!(Signal::from_sig(&Sig::Custom("NOPE".to_string())), None);
    }
}
