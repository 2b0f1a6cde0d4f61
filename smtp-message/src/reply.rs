use std::{fmt, io::IoSlice, iter, str};

use nom::{
    bytes::streaming::{tag, take_until},
    character::streaming::{digit1, one_of},
    combinator::{map, map_res, opt},
    sequence::{terminated, tuple},
    IResult,
};

use crate::MaybeUtf8;

/// A three-digit SMTP reply code, RFC 5321 §4.2.
///
/// Carries its own ASCII rendering so that `Reply::as_io_slices` can hand
/// out a vectored-write slice without allocating.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ReplyCode {
    code: u16,
    text: [u8; 3],
}

impl ReplyCode {
    const fn new_const(code: u16) -> ReplyCode {
        ReplyCode {
            code,
            text: [
                b'0' + ((code / 100) % 10) as u8,
                b'0' + ((code / 10) % 10) as u8,
                b'0' + (code % 10) as u8,
            ],
        }
    }

    pub const SYSTEM_STATUS: ReplyCode = ReplyCode::new_const(211);
    pub const HELP_MESSAGE: ReplyCode = ReplyCode::new_const(214);
    pub const SERVICE_READY: ReplyCode = ReplyCode::new_const(220);
    pub const CLOSING_CHANNEL: ReplyCode = ReplyCode::new_const(221);
    pub const AUTH_SUCCESSFUL: ReplyCode = ReplyCode::new_const(235);
    pub const AUTH_CONTINUE: ReplyCode = ReplyCode::new_const(334);
    pub const OKAY: ReplyCode = ReplyCode::new_const(250);
    pub const USER_NOT_LOCAL_WILL_FORWARD: ReplyCode = ReplyCode::new_const(251);
    pub const CANNOT_VRFY_BUT_PLEASE_TRY: ReplyCode = ReplyCode::new_const(252);
    pub const START_MAIL_INPUT: ReplyCode = ReplyCode::new_const(354);
    pub const SERVICE_NOT_AVAILABLE: ReplyCode = ReplyCode::new_const(421);
    pub const MAILBOX_TEMPORARILY_UNAVAILABLE: ReplyCode = ReplyCode::new_const(450);
    pub const LOCAL_ERROR: ReplyCode = ReplyCode::new_const(451);
    pub const INSUFFICIENT_STORAGE: ReplyCode = ReplyCode::new_const(452);
    pub const UNABLE_TO_ACCEPT_PARAMETERS: ReplyCode = ReplyCode::new_const(455);
    pub const COMMAND_UNRECOGNIZED: ReplyCode = ReplyCode::new_const(500);
    pub const SYNTAX_ERROR: ReplyCode = ReplyCode::new_const(501);
    pub const COMMAND_UNIMPLEMENTED: ReplyCode = ReplyCode::new_const(502);
    pub const BAD_SEQUENCE: ReplyCode = ReplyCode::new_const(503);
    pub const PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode::new_const(504);
    pub const AUTHENTICATION_REQUIRED: ReplyCode = ReplyCode::new_const(530);
    pub const AUTHENTICATION_FAILED: ReplyCode = ReplyCode::new_const(535);
    pub const MAILBOX_UNAVAILABLE: ReplyCode = ReplyCode::new_const(550);
    pub const POLICY_REASON: ReplyCode = ReplyCode::new_const(550);
    pub const USER_NOT_LOCAL: ReplyCode = ReplyCode::new_const(551);
    pub const EXCEEDED_STORAGE: ReplyCode = ReplyCode::new_const(552);
    pub const MAILBOX_NAME_INCORRECT: ReplyCode = ReplyCode::new_const(553);
    pub const TRANSACTION_FAILED: ReplyCode = ReplyCode::new_const(554);
    pub const MAIL_OR_RCPT_PARAMETER_UNIMPLEMENTED: ReplyCode = ReplyCode::new_const(555);
    pub const ENCRYPTION_REQUIRED_FOR_AUTH: ReplyCode = ReplyCode::new_const(538);

    #[inline]
    pub fn custom(code: u16) -> ReplyCode {
        assert!(code < 1000);
        ReplyCode::new_const(code)
    }

    #[inline]
    pub fn code(&self) -> u16 {
        self.code
    }

    /// First digit, RFC 5321 §4.2.1.
    pub fn kind(&self) -> ReplyCodeKind {
        match self.code / 100 {
            2 => ReplyCodeKind::PositiveCompletion,
            3 => ReplyCodeKind::PositiveIntermediate,
            4 => ReplyCodeKind::TransientNegative,
            _ => ReplyCodeKind::PermanentNegative,
        }
    }

    /// Second digit, RFC 5321 §4.2.1.
    pub fn category(&self) -> ReplyCodeCategory {
        match (self.code / 10) % 10 {
            0 => ReplyCodeCategory::Syntax,
            1 => ReplyCodeCategory::Information,
            2 => ReplyCodeCategory::Connections,
            5 => ReplyCodeCategory::MailSystem,
            _ => ReplyCodeCategory::Unspecified,
        }
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(str::from_utf8(&self.text).unwrap())
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeKind {
    PositiveCompletion,
    PositiveIntermediate,
    TransientNegative,
    PermanentNegative,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ReplyCodeCategory {
    Syntax,
    Information,
    Connections,
    Unspecified,
    MailSystem,
}

/// Enhanced status code class, RFC 3463 §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeClass {
    Success,
    PersistentTransientFailure,
    PermanentFailure,
}

/// Enhanced status code subject, RFC 3463 §3.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EnhancedReplyCodeSubject {
    Undefined,
    Addressing,
    Mailbox,
    MailSystem,
    NetworkAndRouting,
    MailDeliveryProtocol,
    MessageContent,
    Policy,
}

impl EnhancedReplyCodeSubject {
    fn digit(self) -> u8 {
        match self {
            EnhancedReplyCodeSubject::Undefined => 0,
            EnhancedReplyCodeSubject::Addressing => 1,
            EnhancedReplyCodeSubject::Mailbox => 2,
            EnhancedReplyCodeSubject::MailSystem => 3,
            EnhancedReplyCodeSubject::NetworkAndRouting => 4,
            EnhancedReplyCodeSubject::MailDeliveryProtocol => 5,
            EnhancedReplyCodeSubject::MessageContent => 6,
            EnhancedReplyCodeSubject::Policy => 7,
        }
    }

    fn from_digit(d: u8) -> EnhancedReplyCodeSubject {
        match d {
            1 => EnhancedReplyCodeSubject::Addressing,
            2 => EnhancedReplyCodeSubject::Mailbox,
            3 => EnhancedReplyCodeSubject::MailSystem,
            4 => EnhancedReplyCodeSubject::NetworkAndRouting,
            5 => EnhancedReplyCodeSubject::MailDeliveryProtocol,
            6 => EnhancedReplyCodeSubject::MessageContent,
            7 => EnhancedReplyCodeSubject::Policy,
            _ => EnhancedReplyCodeSubject::Undefined,
        }
    }
}

/// An enhanced mail system status code, RFC 3463.
///
/// Not generic over a string type: every call site stores it alongside a
/// `Reply<S>` as a plain `Option<EnhancedReplyCode>`, and it never borrows
/// from the wire buffer.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct EnhancedReplyCode {
    class: EnhancedReplyCodeClass,
    subject: EnhancedReplyCodeSubject,
    detail: u16,
}

impl EnhancedReplyCode {
    pub const SUCCESS_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const SUCCESS_DEST_VALID: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::Success,
        subject: EnhancedReplyCodeSubject::Addressing,
        detail: 1,
    };
    pub const PERMANENT_INVALID_COMMAND: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const PERMANENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const TRANSIENT_UNDEFINED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PersistentTransientFailure,
        subject: EnhancedReplyCodeSubject::Undefined,
        detail: 0,
    };
    pub const TRANSIENT_SYSTEM_INCORRECTLY_CONFIGURED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PersistentTransientFailure,
        subject: EnhancedReplyCodeSubject::MailSystem,
        detail: 5,
    };
    /// RFC 3463 §3.7.11, "Encryption needed".
    pub const PERMANENT_ENCRYPTION_NEEDED: EnhancedReplyCode = EnhancedReplyCode {
        class: EnhancedReplyCodeClass::PermanentFailure,
        subject: EnhancedReplyCodeSubject::Policy,
        detail: 11,
    };

    #[inline]
    pub fn new(
        class: EnhancedReplyCodeClass,
        subject: EnhancedReplyCodeSubject,
        detail: u16,
    ) -> EnhancedReplyCode {
        EnhancedReplyCode {
            class,
            subject,
            detail,
        }
    }

    #[inline]
    pub fn class(&self) -> EnhancedReplyCodeClass {
        self.class
    }

    #[inline]
    pub fn subject(&self) -> EnhancedReplyCodeSubject {
        self.subject
    }

    #[inline]
    pub fn detail(&self) -> u16 {
        self.detail
    }
}

impl fmt::Display for EnhancedReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let class = match self.class {
            EnhancedReplyCodeClass::Success => 2,
            EnhancedReplyCodeClass::PersistentTransientFailure => 4,
            EnhancedReplyCodeClass::PermanentFailure => 5,
        };
        write!(f, "{}.{}.{}", class, self.subject.digit(), self.detail)
    }
}

fn digits_u16(buf: &[u8]) -> IResult<&[u8], u16> {
    map_res(digit1, |d: &[u8]| {
        str::from_utf8(d).unwrap().parse::<u16>()
    })(buf)
}

fn ecode(buf: &[u8]) -> IResult<&[u8], EnhancedReplyCode> {
    map(
        tuple((
            map(one_of("245"), |c| match c {
                '2' => EnhancedReplyCodeClass::Success,
                '4' => EnhancedReplyCodeClass::PersistentTransientFailure,
                _ => EnhancedReplyCodeClass::PermanentFailure,
            }),
            tag(b"."),
            map(digits_u16, |d| EnhancedReplyCodeSubject::from_digit(d as u8)),
            tag(b"."),
            digits_u16,
        )),
        |(class, _, subject, _, detail)| EnhancedReplyCode {
            class,
            subject,
            detail,
        },
    )(buf)
}

/// One line of a (possibly multi-line) SMTP reply, RFC 5321 §4.2.
///
/// `is_last` tells apart the `"250-"` continuation separator from the
/// `"250 "` terminal one.
#[derive(Clone, Debug)]
pub struct ReplyLine<S = String> {
    pub code: ReplyCode,
    pub is_last: bool,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: MaybeUtf8<S>,
}

impl<S> ReplyLine<S> {
    /// 512 - 3 (code) - 1 (sep) - 2 (crlf) = 506.
    pub const MAX_LEN: usize = 506;
}

fn one_reply_line(buf: &[u8]) -> IResult<&[u8], ReplyLine<&str>> {
    let (rest, code) = map_res(digit1, |d: &[u8]| {
        str::from_utf8(d)
            .unwrap()
            .parse::<u16>()
            .map(ReplyCode::custom)
    })(buf)?;
    let (rest, is_last) = map(one_of("- "), |c| c == ' ')(rest)?;
    let (rest, ecode) = opt(terminated(ecode, tag(b" ")))(rest)?;
    let (rest, text) = map_res(take_until("\r\n"), str::from_utf8)(rest)?;
    let (rest, _) = tag(b"\r\n")(rest)?;
    Ok((
        rest,
        ReplyLine {
            code,
            is_last,
            ecode,
            text: MaybeUtf8::from(text),
        },
    ))
}

/// A full SMTP reply: one reply code shared across every line, an optional
/// RFC 3463 enhanced status code carried on the first line, and one or more
/// lines of human-readable text.
#[derive(Clone, Debug)]
pub struct Reply<S = String> {
    pub code: ReplyCode,
    pub ecode: Option<EnhancedReplyCode>,
    pub text: Vec<MaybeUtf8<S>>,
}

impl<S> Reply<S> {
    #[inline]
    pub fn new(
        code: ReplyCode,
        ecode: Option<EnhancedReplyCode>,
        text: Vec<MaybeUtf8<S>>,
    ) -> Reply<S> {
        Reply { code, ecode, text }
    }
}

impl<'a> Reply<&'a str> {
    pub fn parse(buf: &'a [u8]) -> IResult<&'a [u8], Reply<&'a str>> {
        let (mut rest, first) = one_reply_line(buf)?;
        let code = first.code;
        let ecode = first.ecode;
        let mut text = vec![first.text];
        let mut last = first.is_last;
        while !last {
            let (rest2, line) = one_reply_line(rest)?;
            rest = rest2;
            last = line.is_last;
            text.push(line.text);
        }
        Ok((rest, Reply { code, ecode, text }))
    }

    pub fn into_owned(self) -> Reply<String> {
        Reply {
            code: self.code,
            ecode: self.ecode,
            text: self.text.into_iter().map(|t| t.to_owned()).collect(),
        }
    }
}

impl<S> Reply<S>
where
    S: AsRef<str>,
{
    /// Renders each line, yielding `IoSlice`s suitable for a vectored write.
    #[inline]
    pub fn as_io_slices(&self) -> impl Iterator<Item = IoSlice> {
        let nlines = self.text.len();
        self.text.iter().enumerate().flat_map(move |(i, line)| {
            let is_last = i + 1 == nlines;
            iter::once(IoSlice::new(&self.code.text))
                .chain(iter::once(IoSlice::new(if is_last { b" " } else { b"-" })))
                .chain(line.as_io_slices())
                .chain(iter::once(IoSlice::new(b"\r\n")))
        })
    }
}

impl<S> fmt::Display for Reply<S>
where
    S: AsRef<str>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code)?;
        if let Some(ecode) = &self.ecode {
            write!(f, " {}", ecode)?;
        }
        for (i, line) in self.text.iter().enumerate() {
            if i > 0 {
                write!(f, " / ")?;
            }
            write!(f, "{}", line.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_single_line() {
        let (rem, reply) = Reply::<&str>::parse(b"250 Ok\r\n").unwrap();
        assert_eq!(rem, &b""[..]);
        assert_eq!(reply.code, ReplyCode::OKAY);
        assert_eq!(reply.text.len(), 1);
        assert_eq!(reply.text[0].as_str(), "Ok");
    }

    #[test]
    fn parse_multi_line() {
        let (rem, reply) =
            Reply::<&str>::parse(b"250-foo.bar greets you\r\n250-8BITMIME\r\n250 PIPELINING\r\n")
                .unwrap();
        assert_eq!(rem, &b""[..]);
        assert_eq!(reply.code, ReplyCode::OKAY);
        assert_eq!(reply.text.len(), 3);
        assert_eq!(reply.text[2].as_str(), "PIPELINING");
    }

    #[test]
    fn parse_enhanced_code() {
        let (_, reply) = Reply::<&str>::parse(b"250 2.1.5 Ok\r\n").unwrap();
        let ecode = reply.ecode.unwrap();
        assert_eq!(ecode.class(), EnhancedReplyCodeClass::Success);
        assert_eq!(ecode.subject(), EnhancedReplyCodeSubject::MailSystem);
        assert_eq!(ecode.detail(), 5);
    }

    #[test]
    fn incomplete_reply_asks_for_more() {
        assert!(Reply::<&str>::parse(b"250-foo\r\n250 ba")
            .unwrap_err()
            .is_incomplete());
    }

    #[test]
    fn reply_round_trips_through_io_slices() {
        let reply = Reply::new(
            ReplyCode::OKAY,
            None,
            vec![MaybeUtf8::Ascii("Ok"), MaybeUtf8::Ascii("done")],
        );
        let slices: Vec<Vec<u8>> = reply
            .as_io_slices()
            .map(|s| s.to_vec())
            .collect();
        let flat: Vec<u8> = slices.into_iter().flatten().collect();
        assert_eq!(flat, b"250-Ok\r\n250 done\r\n".to_vec());
    }
}
