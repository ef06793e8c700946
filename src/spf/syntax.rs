//-
// Copyright (c) 2024, Jason Lingle
//
// This file is part of Mailauth.
//
// Mailauth is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Mailauth is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Mailauth. If not, see <http://www.gnu.org/licenses/>.


//! Parsing of SPF TXT records.
//!
//! The grammar is in RFC 7208 § 12. A record is parsed completely before
//! anything is evaluated, so a single bad term anywhere invalidates it.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use lazy_static::lazy_static;
use regex::Regex;
use thiserror::Error;

const VERSION: &str = "v=spf1";

lazy_static! {
    // An optional qualifier, then a name which is either a mechanism or a
    // modifier, then whatever follows the name.
    static ref TERM: Regex =
        Regex::new("^([-+?~]?)([a-zA-Z][a-zA-Z0-9._-]*)(.*)$").unwrap();
    // dual-cidr-length = [ ip4-cidr-length ] [ "/" ip6-cidr-length ]
    static ref DUAL_CIDR: Regex =
        Regex::new("(?:/([0-9]+))?(?://([0-9]+))?$").unwrap();
}

/// A parsed SPF record.
///
/// Each directive is kept alongside the text of the term it came from, which
/// is what gets reported as the matching mechanism.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record<'a> {
    pub directives: Vec<(&'a str, Directive<'a>)>,
    pub redirect: Option<MacroString<'a>>,
    pub explanation: Option<MacroString<'a>>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Term<'a> {
    Directive(Directive<'a>),
    Modifier(Modifier<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Directive<'a> {
    pub qualifier: Qualifier,
    pub mechanism: Mechanism<'a>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Qualifier {
    Pass,
    Fail,
    SoftFail,
    Neutral,
}

/// The prefix lengths that can follow an address or a host name.
///
/// `None` means the whole address must match.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CidrLengths {
    pub v4: Option<u32>,
    pub v6: Option<u32>,
}

impl CidrLengths {
    pub fn v4(len: u32) -> Self {
        Self {
            v4: Some(len),
            v6: None,
        }
    }

    pub fn v6(len: u32) -> Self {
        Self {
            v4: None,
            v6: Some(len),
        }
    }

    pub fn both(v4: u32, v6: u32) -> Self {
        Self {
            v4: Some(v4),
            v6: Some(v6),
        }
    }
}

// Domain arguments are `domain-spec`s. These are kept as raw macro strings
// and only checked for being valid domains once expanded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Mechanism<'a> {
    All,
    Include(MacroString<'a>),
    A(Option<MacroString<'a>>, CidrLengths),
    Mx(Option<MacroString<'a>>, CidrLengths),
    Ptr(Option<MacroString<'a>>),
    /// `ip4` or `ip6`. Only the length for the address's own family is ever
    /// set.
    Ip(IpAddr, CidrLengths),
    Exists(MacroString<'a>),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Modifier<'a> {
    Redirect(MacroString<'a>),
    Explanation(MacroString<'a>),
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacroString<'a>(&'a str);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MacroElement<'a> {
    Literal(&'a str),
    Expand(MacroExpand<'a>),
}

/// A `%{...}` macro.
///
/// The escapes `%%`, `%_` and `%-` are returned as literals instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MacroExpand<'a> {
    pub kind: Macro,
    /// How many of the rightmost parts to keep.
    pub keep_parts: Option<usize>,
    pub reverse: bool,
    pub delimiters: &'a str,
    /// The macro letter was uppercase.
    pub url_encode: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Macro {
    Sender,
    SenderLocalPart,
    SenderDomain,
    Domain,
    Ip,
    Ptr,
    IpVersion,
    HeloDomain,
    SmtpClientIp,
    ReceivingHost,
    CurrentTimestamp,
}

impl Macro {
    fn from_letter(letter: char) -> Result<Self, Error> {
        Ok(match letter.to_ascii_lowercase() {
            's' => Self::Sender,
            'l' => Self::SenderLocalPart,
            'o' => Self::SenderDomain,
            'd' => Self::Domain,
            'i' => Self::Ip,
            'p' => Self::Ptr,
            'v' => Self::IpVersion,
            'h' => Self::HeloDomain,
            'c' => Self::SmtpClientIp,
            'r' => Self::ReceivingHost,
            't' => Self::CurrentTimestamp,
            _ => return Err(Error::UnknownMacro(letter)),
        })
    }

    /// Whether this macro may only be used in an explanation string.
    pub fn is_exp_only(self) -> bool {
        matches!(
            self,
            Self::SmtpClientIp | Self::ReceivingHost | Self::CurrentTimestamp,
        )
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("missing v=spf1 version tag")]
    MissingVersion,
    #[error("invalid integer")]
    InvalidInteger,
    #[error("invalid IP address")]
    InvalidIpAddress,
    #[error("unknown character: {0}")]
    UnknownCharacter(char),
    #[error("unknown mechanism")]
    UnknownMechanism,
    #[error("unknown macro transformer: {0}")]
    UnknownMacroTransformer(char),
    #[error("unknown macro: {0}")]
    UnknownMacro(char),
    #[error("macro only allowed in explanations")]
    ExpOnlyMacro,
    #[error("unused argument for {0}")]
    UnusedArgument(&'static str),
    #[error("missing argument for {0}")]
    MissingArgument(&'static str),
    #[error("empty domain for {0}")]
    EmptyDomain(&'static str),
    #[error("duplicate {0} modifier")]
    DuplicateModifier(&'static str),
    #[error("empty directive")]
    EmptyDirective,
    #[error("isolated percent sign")]
    IsolatedPercent,
    #[error("unterminated macro expand")]
    UnterminatedMacroExpand,
    #[error("empty macro")]
    EmptyMacro,
}

impl<'a> Record<'a> {
    /// Returns whether `txt` claims to be an SPF record.
    ///
    /// RFC 7208 § 4.5: the version tag must be followed by a space or the end
    /// of the text. Other TXT records are ignored rather than being errors.
    pub fn is_spf(txt: &str) -> bool {
        let Some(rest) = txt
            .get(..VERSION.len())
            .filter(|v| v.eq_ignore_ascii_case(VERSION))
            .map(|_| &txt[VERSION.len()..])
        else {
            return false;
        };

        rest.is_empty() || rest.starts_with(' ')
    }

    /// Parses a complete record, including the version tag.
    pub fn parse(txt: &'a str) -> Result<Self, Error> {
        let mut terms = txt.split_ascii_whitespace();
        match terms.next() {
            Some(v) if v.eq_ignore_ascii_case(VERSION) => {},
            _ => return Err(Error::MissingVersion),
        }

        let mut record = Self {
            directives: Vec::new(),
            redirect: None,
            explanation: None,
        };

        for text in terms {
            match Term::parse(text)? {
                Term::Directive(directive) => {
                    if let Some(domain) = directive.mechanism.domain() {
                        domain.validate(false)?;
                    }
                    record.directives.push((text, directive));
                },

                Term::Modifier(Modifier::Redirect(target)) => {
                    target.validate(false)?;
                    set_once(&mut record.redirect, "redirect", target)?;
                },

                Term::Modifier(Modifier::Explanation(target)) => {
                    target.validate(true)?;
                    set_once(&mut record.explanation, "exp", target)?;
                },

                Term::Modifier(Modifier::Unknown) => {},
            }
        }

        Ok(record)
    }
}

fn set_once<'a>(
    slot: &mut Option<MacroString<'a>>,
    name: &'static str,
    value: MacroString<'a>,
) -> Result<(), Error> {
    if slot.replace(value).is_some() {
        Err(Error::DuplicateModifier(name))
    } else {
        Ok(())
    }
}

impl<'a> Term<'a> {
    /// Parses a single space-delimited term.
    pub fn parse(text: &'a str) -> Result<Self, Error> {
        let Some(captures) = TERM.captures(text) else {
            return Err(match text.trim_start_matches(['-', '+', '?', '~']) {
                "" => Error::EmptyDirective,
                rest => Error::UnknownCharacter(
                    rest.chars().next().unwrap_or_default(),
                ),
            });
        };

        let qualifier = captures.get(1).map_or("", |m| m.as_str());
        let (Some(name), Some(rest)) = (captures.get(2), captures.get(3))
        else {
            return Err(Error::EmptyDirective);
        };
        let (name, rest) = (name.as_str(), rest.as_str());

        if let Some(value) = rest.strip_prefix('=') {
            // Modifiers take no qualifier.
            if !qualifier.is_empty() {
                return Err(Error::UnknownMechanism);
            }

            return Ok(Self::Modifier(Modifier::parse(name, value)?));
        }

        let qualifier = match qualifier {
            "-" => Qualifier::Fail,
            "~" => Qualifier::SoftFail,
            "?" => Qualifier::Neutral,
            _ => Qualifier::Pass,
        };

        Ok(Self::Directive(Directive {
            qualifier,
            mechanism: Mechanism::parse(name, rest)?,
        }))
    }
}

impl<'a> Modifier<'a> {
    fn parse(name: &str, value: &'a str) -> Result<Self, Error> {
        if name.eq_ignore_ascii_case("redirect") {
            domain_spec("redirect", value).map(Self::Redirect)
        } else if name.eq_ignore_ascii_case("exp") {
            domain_spec("exp", value).map(Self::Explanation)
        } else {
            Ok(Self::Unknown)
        }
    }
}

fn domain_spec<'a>(
    what: &'static str,
    text: &'a str,
) -> Result<MacroString<'a>, Error> {
    if text.is_empty() {
        Err(Error::EmptyDomain(what))
    } else {
        Ok(MacroString(text))
    }
}

/// Parses the `:domain` argument that follows a mechanism name.
fn required_domain<'a>(
    what: &'static str,
    rest: &'a str,
) -> Result<MacroString<'a>, Error> {
    let arg = rest.strip_prefix(':').ok_or(Error::MissingArgument(what))?;
    domain_spec(what, arg)
}

fn optional_domain<'a>(
    what: &'static str,
    rest: &'a str,
) -> Result<Option<MacroString<'a>>, Error> {
    match rest.strip_prefix(':') {
        Some(arg) => domain_spec(what, arg).map(Some),
        None if rest.is_empty() => Ok(None),
        None => Err(Error::UnknownMechanism),
    }
}

fn cidr_length(digits: &str, max: u32) -> Result<u32, Error> {
    match digits.parse::<u32>() {
        Ok(len) if len <= max => Ok(len),
        _ => Err(Error::InvalidInteger),
    }
}

/// Splits a trailing `dual-cidr-length` off `rest`.
///
/// RFC 7208 § 5.6: the IPv4 length is introduced by one slash and the IPv6
/// length by two, e.g. `a:example.com/24//64`.
fn split_dual_cidr(rest: &str) -> Result<(&str, CidrLengths), Error> {
    let Some(captures) = DUAL_CIDR.captures(rest) else {
        return Ok((rest, CidrLengths::default()));
    };
    let Some(whole) = captures.get(0) else {
        return Ok((rest, CidrLengths::default()));
    };

    let lengths = CidrLengths {
        v4: captures
            .get(1)
            .map(|m| cidr_length(m.as_str(), 32))
            .transpose()?,
        v6: captures
            .get(2)
            .map(|m| cidr_length(m.as_str(), 128))
            .transpose()?,
    };
    Ok((&rest[..whole.start()], lengths))
}

/// Parses the `:address[/length]` argument of `ip4` or `ip6`.
fn address_arg<'a>(
    what: &'static str,
    rest: &'a str,
) -> Result<(&'a str, Option<&'a str>), Error> {
    match rest.strip_prefix(':') {
        None | Some("") => Err(Error::MissingArgument(what)),
        Some(arg) => Ok(match arg.split_once('/') {
            Some((addr, len)) => (addr, Some(len)),
            None => (arg, None),
        }),
    }
}

impl<'a> Mechanism<'a> {
    fn parse(name: &str, rest: &'a str) -> Result<Self, Error> {
        let is = |n: &str| name.eq_ignore_ascii_case(n);

        if is("all") {
            if !rest.is_empty() {
                return Err(Error::UnusedArgument("all"));
            }

            Ok(Self::All)
        } else if is("include") {
            required_domain("include", rest).map(Self::Include)
        } else if is("exists") {
            required_domain("exists", rest).map(Self::Exists)
        } else if is("ptr") {
            optional_domain("ptr", rest).map(Self::Ptr)
        } else if is("a") {
            let (rest, lengths) = split_dual_cidr(rest)?;
            Ok(Self::A(optional_domain("a", rest)?, lengths))
        } else if is("mx") {
            let (rest, lengths) = split_dual_cidr(rest)?;
            Ok(Self::Mx(optional_domain("mx", rest)?, lengths))
        } else if is("ip4") {
            let (addr, len) = address_arg("ip4", rest)?;
            let addr = addr
                .parse::<Ipv4Addr>()
                .map_err(|_| Error::InvalidIpAddress)?;
            let v4 = len.map(|l| cidr_length(l, 32)).transpose()?;
            Ok(Self::Ip(addr.into(), CidrLengths { v4, v6: None }))
        } else if is("ip6") {
            let (addr, len) = address_arg("ip6", rest)?;
            let addr = addr
                .parse::<Ipv6Addr>()
                .map_err(|_| Error::InvalidIpAddress)?;
            let v6 = len.map(|l| cidr_length(l, 128)).transpose()?;
            Ok(Self::Ip(addr.into(), CidrLengths { v4: None, v6 }))
        } else {
            Err(Error::UnknownMechanism)
        }
    }

    /// The domain argument, if this mechanism has one.
    pub fn domain(&self) -> Option<MacroString<'a>> {
        match *self {
            Self::Include(d) | Self::Exists(d) => Some(d),
            Self::A(d, _) | Self::Mx(d, _) | Self::Ptr(d) => d,
            Self::All | Self::Ip(..) => None,
        }
    }
}

impl<'a> MacroString<'a> {
    pub fn new(text: &'a str) -> Self {
        Self(text)
    }

    /// Checks that every element of the string parses.
    ///
    /// Outside explanations (`in_exp == false`), the `c`, `r` and `t` macros
    /// are rejected.
    pub fn validate(self, in_exp: bool) -> Result<(), Error> {
        self.into_iter().try_for_each(|element| match element? {
            MacroElement::Expand(me) if !in_exp && me.kind.is_exp_only() => {
                Err(Error::ExpOnlyMacro)
            },
            _ => Ok(()),
        })
    }
}

impl<'a> IntoIterator for MacroString<'a> {
    type Item = Result<MacroElement<'a>, Error>;
    type IntoIter = MacroElements<'a>;

    fn into_iter(self) -> MacroElements<'a> {
        MacroElements(self.0)
    }
}

/// Iterates the elements of a `MacroString`.
///
/// Iteration stops after the first error.
#[derive(Clone, Debug)]
pub struct MacroElements<'a>(&'a str);

impl<'a> Iterator for MacroElements<'a> {
    type Item = Result<MacroElement<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.0.is_empty() {
            return None;
        }

        let Some(escape) = self.0.strip_prefix('%') else {
            let end = self.0.find('%').unwrap_or(self.0.len());
            let (literal, rest) = self.0.split_at(end);
            self.0 = rest;
            return Some(Ok(MacroElement::Literal(literal)));
        };

        match parse_escape(escape) {
            Ok((element, rest)) => {
                self.0 = rest;
                Some(Ok(element))
            },
            Err(e) => {
                self.0 = "";
                Some(Err(e))
            },
        }
    }
}

/// Parses what follows a `%`, returning the element and the remaining text.
fn parse_escape(text: &str) -> Result<(MacroElement<'_>, &str), Error> {
    let mut chars = text.chars();
    let literal = match chars.next() {
        Some('%') => "%",
        Some('_') => " ",
        Some('-') => "%20",
        Some('{') => {
            let (body, rest) = chars
                .as_str()
                .split_once('}')
                .ok_or(Error::UnterminatedMacroExpand)?;
            let expand = MacroExpand::parse(body)?;
            return Ok((MacroElement::Expand(expand), rest));
        },
        _ => return Err(Error::IsolatedPercent),
    };

    Ok((MacroElement::Literal(literal), chars.as_str()))
}

impl<'a> MacroExpand<'a> {
    /// Parses the text between `%{` and `}`.
    ///
    /// macro-letter transformers *delimiter, where transformers is
    /// *DIGIT [ "r" ].
    fn parse(body: &'a str) -> Result<Self, Error> {
        let mut chars = body.chars();
        let letter = chars.next().ok_or(Error::EmptyMacro)?;
        let kind = Macro::from_letter(letter)?;

        let rest = chars.as_str();
        let (digits, rest) = rest.split_at(
            rest.find(|c: char| !c.is_ascii_digit())
                .unwrap_or(rest.len()),
        );
        let keep_parts = match digits {
            "" => None,
            // RFC 7208 § 7.1: zero is not allowed
            _ => match digits.parse::<usize>() {
                Ok(n) if n > 0 => Some(n),
                _ => return Err(Error::InvalidInteger),
            },
        };

        let (reverse, delimiters) =
            match rest.strip_prefix(|c: char| c.eq_ignore_ascii_case(&'r')) {
                Some(delimiters) => (true, delimiters),
                None => (false, rest),
            };
        if let Some(c) = delimiters.chars().find(|c| !".-+,/_=".contains(*c))
        {
            return Err(Error::UnknownMacroTransformer(c));
        }

        Ok(Self {
            kind,
            keep_parts,
            reverse,
            delimiters,
            url_encode: letter.is_ascii_uppercase(),
        })
    }
}
