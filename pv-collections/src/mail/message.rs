//! Parsed message representation handed to the injector (SPEC §3).
//!
//! MIME parsing itself is an external collaborator (§1 non-goals):
//! `eml-codec` does the parsing, this module only shapes the result into
//! the tree the Injector walks.

use chrono::{DateTime, Utc};
use eml_codec::{header, part::AnyPart};

use crate::mail::names::AddressKey;
use crate::mail::IMF;

/// A header field as it appeared in the original message, preserving
/// original order via its position in `Message::headers`.
#[derive(Debug, Clone)]
pub struct HeaderField {
    pub name: String,
    pub value: Vec<u8>,
}

/// `(entry-path, attribute, value)` — §3's Annotation tuple. `owner` is
/// `None` for a shared annotation, `Some(username)` for a private one,
/// mirroring `annotations.owner`'s nullability directly.
#[derive(Debug, Clone)]
pub struct Annotation {
    pub entry: String,
    pub attribute: String,
    pub value: Option<Vec<u8>>,
    pub owner: Option<String>,
}

/// Which header an address was collected from, preserved so address
/// linking can record role and position (SPEC §4.G step 5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressRole {
    From,
    Sender,
    ReplyTo,
    To,
    Cc,
    Bcc,
}

impl AddressRole {
    pub fn header_name(&self) -> &'static str {
        match self {
            AddressRole::From => "From",
            AddressRole::Sender => "Sender",
            AddressRole::ReplyTo => "Reply-To",
            AddressRole::To => "To",
            AddressRole::Cc => "Cc",
            AddressRole::Bcc => "Bcc",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AddressRef {
    pub role: AddressRole,
    pub position: i32,
    pub address: AddressKey,
}

/// A content-typed leaf or multipart node with a stable, dotted part
/// number (SPEC §3).
#[derive(Debug, Clone)]
pub enum Bodypart {
    Leaf {
        part_number: String,
        content_type: String,
        payload: BodypartPayload,
    },
    Multipart {
        part_number: String,
        children: Vec<Bodypart>,
    },
}

#[derive(Debug, Clone)]
pub enum BodypartPayload {
    Text(String),
    Binary(Vec<u8>),
}

impl Bodypart {
    pub fn part_number(&self) -> &str {
        match self {
            Bodypart::Leaf { part_number, .. } => part_number,
            Bodypart::Multipart { part_number, .. } => part_number,
        }
    }

    /// Depth-first walk yielding every leaf, used by the Injector's
    /// bodypart-insertion step.
    pub fn leaves(&self) -> Vec<&Bodypart> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Bodypart>) {
        match self {
            Bodypart::Leaf { .. } => out.push(self),
            Bodypart::Multipart { children, .. } => {
                for child in children {
                    child.collect_leaves(out);
                }
            }
        }
    }
}

/// Assigns stable, 1-based dotted part numbers to a bodypart tree in
/// place, per SPEC §4.G step 1 ("TEXT parts inherit their parent's
/// number").
pub fn number_parts(part: &mut Bodypart, prefix: &str) {
    match part {
        Bodypart::Leaf { part_number, .. } => *part_number = prefix.to_string(),
        Bodypart::Multipart {
            part_number,
            children,
        } => {
            *part_number = prefix.to_string();
            for (i, child) in children.iter_mut().enumerate() {
                let child_prefix = if prefix.is_empty() {
                    format!("{}", i + 1)
                } else {
                    format!("{prefix}.{}", i + 1)
                };
                number_parts(child, &child_prefix);
            }
        }
    }
}

/// A parsed, immutable message ready for injection.
#[derive(Debug, Clone)]
pub struct Message {
    pub headers: Vec<HeaderField>,
    pub addresses: Vec<AddressRef>,
    pub body: Bodypart,
    pub subject: Option<String>,
    pub internal_date: DateTime<Utc>,
    pub rfc822_size: i64,
    /// Indicates this message is a synthetic wrapper generated around a
    /// malformed original (SPEC §3).
    pub wrapped: bool,
}

impl Message {
    pub fn header_names(&self) -> Vec<String> {
        self.headers.iter().map(|h| h.name.clone()).collect()
    }

    /// Shapes a parsed message into the tree the Injector walks (SPEC
    /// §4.G step 1). `size` is the original RFC 822 byte length, passed
    /// separately since `IMF` only borrows the parsed view.
    ///
    /// A `message/rfc822` child is flattened to a single binary leaf
    /// holding its raw bytes rather than recursed into: SPEC_FULL only
    /// asks the injector to address parts by dotted number, and the
    /// corpus's own `mime_view` recursion for BODYSTRUCTURE lives in the
    /// IMAP fetch path, not here.
    pub fn from_imf(imf: &IMF<'_>, size: i64) -> Message {
        let top = imf.parsed.child.mime();
        let headers = top
            .kv
            .iter()
            .filter_map(|field| match field {
                header::Field::Good(header::Kv2(k, v)) => Some(HeaderField {
                    name: String::from_utf8_lossy(k).into_owned(),
                    value: v.to_vec(),
                }),
                _ => None,
            })
            .collect();

        let addresses = collect_addresses(imf);

        let mut body = bodypart_tree(&imf.parsed.child);
        number_parts(&mut body, "");

        let subject = imf.parsed.imf.subject.as_ref().map(|s| s.to_string());
        let internal_date = imf
            .parsed
            .imf
            .date
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        Message {
            headers,
            addresses,
            body,
            subject,
            internal_date,
            rfc822_size: size,
            wrapped: false,
        }
    }
}

fn collect_addresses(imf: &IMF<'_>) -> Vec<AddressRef> {
    use eml_codec::imf::address::AddressRef as EmlAddr;

    let msg = &imf.parsed.imf;
    let mut out = Vec::new();

    let mut push_role = |role: AddressRole, refs: &[eml_codec::imf::mailbox::MailboxRef]| {
        for (position, a) in refs.iter().enumerate() {
            out.push(AddressRef {
                role,
                position: position as i32,
                address: AddressKey {
                    localpart: a.addrspec.local_part.to_string(),
                    domain: a.addrspec.domain.to_string(),
                    name: a.name.as_ref().map(|n| n.to_string()).unwrap_or_default(),
                },
            });
        }
    };

    push_role(AddressRole::From, &msg.from);
    if let Some(sender) = &msg.sender {
        push_role(AddressRole::Sender, std::slice::from_ref(sender));
    }

    let flatten = |list: &[EmlAddr]| -> Vec<eml_codec::imf::mailbox::MailboxRef> {
        let mut acc = Vec::new();
        for item in list {
            match item {
                EmlAddr::Single(a) => acc.push(a.clone()),
                EmlAddr::Many(l) => acc.extend(l.participants.iter().cloned()),
            }
        }
        acc
    };

    push_role(AddressRole::ReplyTo, &flatten(&msg.reply_to));
    push_role(AddressRole::To, &flatten(&msg.to));
    push_role(AddressRole::Cc, &flatten(&msg.cc));
    push_role(AddressRole::Bcc, &flatten(&msg.bcc));

    out
}

fn bodypart_tree(part: &AnyPart<'_>) -> Bodypart {
    match part {
        AnyPart::Txt(t) => Bodypart::Leaf {
            part_number: String::new(),
            content_type: content_type_of(t.mime.fields.ctype.as_ref(), "text/plain"),
            payload: BodypartPayload::Text(String::from_utf8_lossy(t.body).into_owned()),
        },
        AnyPart::Bin(b) => Bodypart::Leaf {
            part_number: String::new(),
            content_type: content_type_of(b.mime.fields.ctype.as_ref(), "application/octet-stream"),
            payload: BodypartPayload::Binary(b.body.to_vec()),
        },
        AnyPart::Msg(m) => Bodypart::Leaf {
            part_number: String::new(),
            content_type: "message/rfc822".to_string(),
            payload: BodypartPayload::Binary(m.raw_part.to_vec()),
        },
        AnyPart::Mult(mp) => Bodypart::Multipart {
            part_number: String::new(),
            children: mp.children.iter().map(bodypart_tree).collect(),
        },
    }
}

fn content_type_of(ctype: Option<&eml_codec::mime::r#type::NaiveType<'_>>, default: &str) -> String {
    match ctype {
        Some(t) => format!(
            "{}/{}",
            String::from_utf8_lossy(t.main),
            String::from_utf8_lossy(t.sub)
        ),
        None => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaf() -> Bodypart {
        Bodypart::Leaf {
            part_number: String::new(),
            content_type: "text/plain".into(),
            payload: BodypartPayload::Text(String::new()),
        }
    }

    #[test]
    fn number_parts_assigns_dotted_1_based_numbers() {
        let mut tree = Bodypart::Multipart {
            part_number: String::new(),
            children: vec![
                leaf(),
                Bodypart::Multipart {
                    part_number: String::new(),
                    children: vec![leaf(), leaf()],
                },
            ],
        };
        number_parts(&mut tree, "");

        assert_eq!(tree.part_number(), "");
        let Bodypart::Multipart { children, .. } = &tree else { unreachable!() };
        assert_eq!(children[0].part_number(), "1");
        assert_eq!(children[1].part_number(), "2");
        let Bodypart::Multipart { children: grandchildren, .. } = &children[1] else { unreachable!() };
        assert_eq!(grandchildren[0].part_number(), "2.1");
        assert_eq!(grandchildren[1].part_number(), "2.2");
    }

    #[test]
    fn leaves_is_a_depth_first_walk_skipping_multipart_nodes() {
        let mut tree = Bodypart::Multipart {
            part_number: String::new(),
            children: vec![
                leaf(),
                Bodypart::Multipart {
                    part_number: String::new(),
                    children: vec![leaf()],
                },
            ],
        };
        number_parts(&mut tree, "");
        let numbers: Vec<&str> = tree.leaves().iter().map(|l| l.part_number()).collect();
        assert_eq!(numbers, vec!["1", "2.1"]);
    }
}
