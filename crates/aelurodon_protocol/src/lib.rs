/*
 * SPDX-FileCopyrightText: 2026 Aelurodon Contributors
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::collections::BTreeMap;

pub const AS_PUBLIC: &str = "https://www.w3.org/ns/activitystreams#Public";
pub const AS_CONTEXT: &str = "https://www.w3.org/ns/activitystreams";
pub const SECURITY_CONTEXT: &str = "https://w3id.org/security/v1";

/// ActivityStreams type tag. Activities and objects share one tag space;
/// unknown types round-trip through `Other` instead of failing decode.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    Create,
    Update,
    Delete,
    Announce,
    Like,
    EmojiReact,
    Follow,
    Accept,
    Reject,
    Block,
    Ignore,
    Undo,
    Add,
    Remove,
    Note,
    Article,
    Question,
    Event,
    Page,
    Person,
    Group,
    Service,
    Application,
    Organization,
    Tombstone,
    Collection,
    OrderedCollection,
    Mention,
    Hashtag,
    Emoji,
    Image,
    Document,
    PropertyValue,
    Other(String),
}

impl Kind {
    pub fn as_str(&self) -> &str {
        match self {
            Kind::Create => "Create",
            Kind::Update => "Update",
            Kind::Delete => "Delete",
            Kind::Announce => "Announce",
            Kind::Like => "Like",
            Kind::EmojiReact => "EmojiReact",
            Kind::Follow => "Follow",
            Kind::Accept => "Accept",
            Kind::Reject => "Reject",
            Kind::Block => "Block",
            Kind::Ignore => "Ignore",
            Kind::Undo => "Undo",
            Kind::Add => "Add",
            Kind::Remove => "Remove",
            Kind::Note => "Note",
            Kind::Article => "Article",
            Kind::Question => "Question",
            Kind::Event => "Event",
            Kind::Page => "Page",
            Kind::Person => "Person",
            Kind::Group => "Group",
            Kind::Service => "Service",
            Kind::Application => "Application",
            Kind::Organization => "Organization",
            Kind::Tombstone => "Tombstone",
            Kind::Collection => "Collection",
            Kind::OrderedCollection => "OrderedCollection",
            Kind::Mention => "Mention",
            Kind::Hashtag => "Hashtag",
            Kind::Emoji => "Emoji",
            Kind::Image => "Image",
            Kind::Document => "Document",
            Kind::PropertyValue => "PropertyValue",
            Kind::Other(s) => s.as_str(),
        }
    }

    /// Post object types that may carry content and appear inside a `Create`.
    pub fn is_post(&self) -> bool {
        matches!(
            self,
            Kind::Note | Kind::Article | Kind::Question | Kind::Event | Kind::Page
        )
    }

    pub fn is_actor(&self) -> bool {
        matches!(
            self,
            Kind::Person | Kind::Group | Kind::Service | Kind::Application | Kind::Organization
        )
    }

    pub fn is_activity(&self) -> bool {
        matches!(
            self,
            Kind::Create
                | Kind::Update
                | Kind::Delete
                | Kind::Announce
                | Kind::Like
                | Kind::EmojiReact
                | Kind::Follow
                | Kind::Accept
                | Kind::Reject
                | Kind::Block
                | Kind::Ignore
                | Kind::Undo
                | Kind::Add
                | Kind::Remove
        )
    }
}

impl From<&str> for Kind {
    fn from(s: &str) -> Self {
        match s {
            "Create" => Kind::Create,
            "Update" => Kind::Update,
            "Delete" => Kind::Delete,
            "Announce" => Kind::Announce,
            "Like" => Kind::Like,
            "EmojiReact" => Kind::EmojiReact,
            "Follow" => Kind::Follow,
            "Accept" => Kind::Accept,
            "Reject" => Kind::Reject,
            "Block" => Kind::Block,
            "Ignore" => Kind::Ignore,
            "Undo" => Kind::Undo,
            "Add" => Kind::Add,
            "Remove" => Kind::Remove,
            "Note" => Kind::Note,
            "Article" => Kind::Article,
            "Question" => Kind::Question,
            "Event" => Kind::Event,
            "Page" => Kind::Page,
            "Person" => Kind::Person,
            "Group" => Kind::Group,
            "Service" => Kind::Service,
            "Application" => Kind::Application,
            "Organization" => Kind::Organization,
            "Tombstone" => Kind::Tombstone,
            "Collection" => Kind::Collection,
            "OrderedCollection" => Kind::OrderedCollection,
            "Mention" => Kind::Mention,
            "Hashtag" => Kind::Hashtag,
            "Emoji" => Kind::Emoji,
            "Image" => Kind::Image,
            "Document" => Kind::Document,
            "PropertyValue" => Kind::PropertyValue,
            other => Kind::Other(other.to_string()),
        }
    }
}

impl Serialize for Kind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Kind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Kind::from(s.as_str()))
    }
}

/// The `object` field of an activity: a bare id reference or a nested node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ObjectRef {
    Reference(String),
    Node(Box<Envelope>),
}

impl ObjectRef {
    pub fn id(&self) -> Option<&str> {
        match self {
            ObjectRef::Reference(s) => Some(s.as_str()),
            ObjectRef::Node(env) => env.id.as_deref(),
        }
    }

    pub fn as_node(&self) -> Option<&Envelope> {
        match self {
            ObjectRef::Reference(_) => None,
            ObjectRef::Node(env) => Some(env),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tag {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A mute-marker collection attached to a post (`ignores`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(rename = "totalItems", default)]
    pub total_items: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub items: Vec<Envelope>,
}

impl Collection {
    pub fn empty(id: Option<String>) -> Self {
        Self {
            id,
            kind: Kind::Collection,
            total_items: 0,
            items: Vec::new(),
        }
    }
}

/// Common envelope for activities and objects. Fields no variant uses stay
/// in `extra` so foreign payloads survive a decode/encode round trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "@context", skip_serializing_if = "Option::is_none")]
    pub context: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type")]
    pub kind: Kind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actor: Option<String>,
    #[serde(rename = "attributedTo", skip_serializing_if = "Option::is_none")]
    pub attributed_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub published: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated: Option<String>,
    #[serde(default, with = "recipient_set", skip_serializing_if = "Vec::is_empty")]
    pub to: Vec<String>,
    #[serde(default, with = "recipient_set", skip_serializing_if = "Vec::is_empty")]
    pub cc: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object: Option<ObjectRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(rename = "contentMap", skip_serializing_if = "Option::is_none")]
    pub content_map: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation: Option<String>,
    #[serde(rename = "inReplyTo", skip_serializing_if = "Option::is_none")]
    pub in_reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tag: Vec<Tag>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachment: Vec<Attachment>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replies: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignores: Option<Collection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub muted: Option<bool>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl Envelope {
    pub fn new(kind: Kind) -> Self {
        Self {
            context: None,
            id: None,
            kind,
            actor: None,
            attributed_to: None,
            published: None,
            updated: None,
            to: Vec::new(),
            cc: Vec::new(),
            object: None,
            summary: None,
            sensitive: None,
            content: None,
            content_map: None,
            conversation: None,
            in_reply_to: None,
            tag: Vec::new(),
            attachment: Vec::new(),
            replies: None,
            ignores: None,
            muted: None,
            extra: BTreeMap::new(),
        }
    }

    /// All addressed recipients minus the Public pseudo-address.
    pub fn recipients(&self) -> Vec<String> {
        let mut out: Vec<String> = self
            .to
            .iter()
            .chain(self.cc.iter())
            .filter(|r| r.as_str() != AS_PUBLIC)
            .cloned()
            .collect();
        out.sort();
        out.dedup();
        out
    }

    pub fn is_public(&self) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|r| r == AS_PUBLIC)
    }

    pub fn has_recipient(&self, target: &str) -> bool {
        self.to.iter().chain(self.cc.iter()).any(|r| r == target)
    }

    pub fn add_cc(&mut self, target: &str) {
        if !self.has_recipient(target) {
            self.cc.push(target.to_string());
        }
    }

    pub fn object_id(&self) -> Option<&str> {
        self.object.as_ref().and_then(|o| o.id())
    }

    /// Inner node of an `Undo`/`Create`-style wrapper, when embedded.
    pub fn inner(&self) -> Option<&Envelope> {
        self.object.as_ref().and_then(|o| o.as_node())
    }
}

/// `to`/`cc` appear on the wire as a single string or an array.
mod recipient_set {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(v: &Vec<String>, serializer: S) -> Result<S::Ok, S::Error> {
        v.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum OneOrMany {
            One(String),
            Many(Vec<String>),
        }
        Ok(match OneOrMany::deserialize(deserializer)? {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        })
    }
}
