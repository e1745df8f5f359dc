//! Static method descriptors.
//!
//! Each supported method is a [`MethodKind`] variant pointing at one
//! immutable [`MethodType`]. Class identity lives on [`ProtocolClass`], so
//! every method of a class reports the same id and name without any
//! per-instance work.

use std::fmt;

use super::field::FieldType;

/// Protocol classes the gateway understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolClass {
    Connection,
    Channel,
}

impl ProtocolClass {
    pub const fn id(self) -> u16 {
        match self {
            ProtocolClass::Connection => 10,
            ProtocolClass::Channel => 20,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            ProtocolClass::Connection => "connection",
            ProtocolClass::Channel => "channel",
        }
    }

    pub fn from_id(id: u16) -> Option<Self> {
        match id {
            10 => Some(ProtocolClass::Connection),
            20 => Some(ProtocolClass::Channel),
            _ => None,
        }
    }
}

/// One field of a method's argument list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: &'static str,
    pub field_type: FieldType,
}

const fn field(name: &'static str, field_type: FieldType) -> FieldSpec {
    FieldSpec { name, field_type }
}

/// Immutable descriptor of a method type. Identity is `(class_id, method_id)`.
#[derive(Debug, PartialEq, Eq)]
pub struct MethodType {
    pub kind: MethodKind,
    pub class: ProtocolClass,
    pub method_id: u16,
    /// Dotted name, e.g. `connection.start-ok`.
    pub name: &'static str,
    pub fields: &'static [FieldSpec],
}

impl MethodType {
    #[inline]
    pub fn class_id(&self) -> u16 {
        self.class.id()
    }

    #[inline]
    pub fn class_name(&self) -> &'static str {
        self.class.name()
    }

    #[inline]
    pub fn ids(&self) -> (u16, u16) {
        (self.class.id(), self.method_id)
    }

    /// Position of a named field in the argument list.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }
}

impl fmt::Display for MethodType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}/{})", self.name, self.class_id(), self.method_id)
    }
}

/// Every method the gateway can decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MethodKind {
    ConnectionStart,
    ConnectionStartOk,
    ConnectionSecure,
    ConnectionSecureOk,
    ConnectionTune,
    ConnectionTuneOk,
    ConnectionOpen,
    ConnectionOpenOk,
    ConnectionClose,
    ConnectionCloseOk,
    ConnectionBlocked,
    ConnectionUnblocked,
    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow,
    ChannelFlowOk,
    ChannelClose,
    ChannelCloseOk,
}

impl MethodKind {
    pub const ALL: [MethodKind; 18] = [
        MethodKind::ConnectionStart,
        MethodKind::ConnectionStartOk,
        MethodKind::ConnectionSecure,
        MethodKind::ConnectionSecureOk,
        MethodKind::ConnectionTune,
        MethodKind::ConnectionTuneOk,
        MethodKind::ConnectionOpen,
        MethodKind::ConnectionOpenOk,
        MethodKind::ConnectionClose,
        MethodKind::ConnectionCloseOk,
        MethodKind::ConnectionBlocked,
        MethodKind::ConnectionUnblocked,
        MethodKind::ChannelOpen,
        MethodKind::ChannelOpenOk,
        MethodKind::ChannelFlow,
        MethodKind::ChannelFlowOk,
        MethodKind::ChannelClose,
        MethodKind::ChannelCloseOk,
    ];

    pub fn descriptor(self) -> &'static MethodType {
        match self {
            MethodKind::ConnectionStart => &CONNECTION_START,
            MethodKind::ConnectionStartOk => &CONNECTION_START_OK,
            MethodKind::ConnectionSecure => &CONNECTION_SECURE,
            MethodKind::ConnectionSecureOk => &CONNECTION_SECURE_OK,
            MethodKind::ConnectionTune => &CONNECTION_TUNE,
            MethodKind::ConnectionTuneOk => &CONNECTION_TUNE_OK,
            MethodKind::ConnectionOpen => &CONNECTION_OPEN,
            MethodKind::ConnectionOpenOk => &CONNECTION_OPEN_OK,
            MethodKind::ConnectionClose => &CONNECTION_CLOSE,
            MethodKind::ConnectionCloseOk => &CONNECTION_CLOSE_OK,
            MethodKind::ConnectionBlocked => &CONNECTION_BLOCKED,
            MethodKind::ConnectionUnblocked => &CONNECTION_UNBLOCKED,
            MethodKind::ChannelOpen => &CHANNEL_OPEN,
            MethodKind::ChannelOpenOk => &CHANNEL_OPEN_OK,
            MethodKind::ChannelFlow => &CHANNEL_FLOW,
            MethodKind::ChannelFlowOk => &CHANNEL_FLOW_OK,
            MethodKind::ChannelClose => &CHANNEL_CLOSE,
            MethodKind::ChannelCloseOk => &CHANNEL_CLOSE_OK,
        }
    }

    #[inline]
    pub fn ids(self) -> (u16, u16) {
        self.descriptor().ids()
    }

    #[inline]
    pub fn name(self) -> &'static str {
        self.descriptor().name
    }
}

const CLOSE_FIELDS: &[FieldSpec] = &[
    field("reply-code", FieldType::Short),
    field("reply-text", FieldType::ShortStr),
    field("class-id", FieldType::Short),
    field("method-id", FieldType::Short),
];

const TUNE_FIELDS: &[FieldSpec] = &[
    field("channel-max", FieldType::Short),
    field("frame-max", FieldType::Long),
    field("heartbeat", FieldType::Short),
];

static CONNECTION_START: MethodType = MethodType {
    kind: MethodKind::ConnectionStart,
    class: ProtocolClass::Connection,
    method_id: 10,
    name: "connection.start",
    fields: &[
        field("version-major", FieldType::Octet),
        field("version-minor", FieldType::Octet),
        field("server-properties", FieldType::Table),
        field("mechanisms", FieldType::LongStr),
        field("locales", FieldType::LongStr),
    ],
};

static CONNECTION_START_OK: MethodType = MethodType {
    kind: MethodKind::ConnectionStartOk,
    class: ProtocolClass::Connection,
    method_id: 11,
    name: "connection.start-ok",
    fields: &[
        field("client-properties", FieldType::Table),
        field("mechanism", FieldType::ShortStr),
        field("response", FieldType::LongStr),
        field("locale", FieldType::ShortStr),
    ],
};

static CONNECTION_SECURE: MethodType = MethodType {
    kind: MethodKind::ConnectionSecure,
    class: ProtocolClass::Connection,
    method_id: 20,
    name: "connection.secure",
    fields: &[field("challenge", FieldType::LongStr)],
};

static CONNECTION_SECURE_OK: MethodType = MethodType {
    kind: MethodKind::ConnectionSecureOk,
    class: ProtocolClass::Connection,
    method_id: 21,
    name: "connection.secure-ok",
    fields: &[field("response", FieldType::LongStr)],
};

static CONNECTION_TUNE: MethodType = MethodType {
    kind: MethodKind::ConnectionTune,
    class: ProtocolClass::Connection,
    method_id: 30,
    name: "connection.tune",
    fields: TUNE_FIELDS,
};

static CONNECTION_TUNE_OK: MethodType = MethodType {
    kind: MethodKind::ConnectionTuneOk,
    class: ProtocolClass::Connection,
    method_id: 31,
    name: "connection.tune-ok",
    fields: TUNE_FIELDS,
};

static CONNECTION_OPEN: MethodType = MethodType {
    kind: MethodKind::ConnectionOpen,
    class: ProtocolClass::Connection,
    method_id: 40,
    name: "connection.open",
    fields: &[
        field("virtual-host", FieldType::ShortStr),
        field("capabilities", FieldType::ShortStr),
        field("insist", FieldType::Bit),
    ],
};

static CONNECTION_OPEN_OK: MethodType = MethodType {
    kind: MethodKind::ConnectionOpenOk,
    class: ProtocolClass::Connection,
    method_id: 41,
    name: "connection.open-ok",
    fields: &[field("known-hosts", FieldType::ShortStr)],
};

static CONNECTION_CLOSE: MethodType = MethodType {
    kind: MethodKind::ConnectionClose,
    class: ProtocolClass::Connection,
    method_id: 50,
    name: "connection.close",
    fields: CLOSE_FIELDS,
};

static CONNECTION_CLOSE_OK: MethodType = MethodType {
    kind: MethodKind::ConnectionCloseOk,
    class: ProtocolClass::Connection,
    method_id: 51,
    name: "connection.close-ok",
    fields: &[],
};

static CONNECTION_BLOCKED: MethodType = MethodType {
    kind: MethodKind::ConnectionBlocked,
    class: ProtocolClass::Connection,
    method_id: 60,
    name: "connection.blocked",
    fields: &[field("reason", FieldType::ShortStr)],
};

static CONNECTION_UNBLOCKED: MethodType = MethodType {
    kind: MethodKind::ConnectionUnblocked,
    class: ProtocolClass::Connection,
    method_id: 61,
    name: "connection.unblocked",
    fields: &[],
};

static CHANNEL_OPEN: MethodType = MethodType {
    kind: MethodKind::ChannelOpen,
    class: ProtocolClass::Channel,
    method_id: 10,
    name: "channel.open",
    fields: &[field("out-of-band", FieldType::ShortStr)],
};

static CHANNEL_OPEN_OK: MethodType = MethodType {
    kind: MethodKind::ChannelOpenOk,
    class: ProtocolClass::Channel,
    method_id: 11,
    name: "channel.open-ok",
    fields: &[field("channel-id", FieldType::LongStr)],
};

static CHANNEL_FLOW: MethodType = MethodType {
    kind: MethodKind::ChannelFlow,
    class: ProtocolClass::Channel,
    method_id: 20,
    name: "channel.flow",
    fields: &[field("active", FieldType::Bit)],
};

static CHANNEL_FLOW_OK: MethodType = MethodType {
    kind: MethodKind::ChannelFlowOk,
    class: ProtocolClass::Channel,
    method_id: 21,
    name: "channel.flow-ok",
    fields: &[field("active", FieldType::Bit)],
};

static CHANNEL_CLOSE: MethodType = MethodType {
    kind: MethodKind::ChannelClose,
    class: ProtocolClass::Channel,
    method_id: 40,
    name: "channel.close",
    fields: CLOSE_FIELDS,
};

static CHANNEL_CLOSE_OK: MethodType = MethodType {
    kind: MethodKind::ChannelCloseOk,
    class: ProtocolClass::Channel,
    method_id: 41,
    name: "channel.close-ok",
    fields: &[],
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_points_back_at_kind() {
        for kind in MethodKind::ALL {
            assert_eq!(kind.descriptor().kind, kind);
        }
    }

    #[test]
    fn test_class_identity_shared_by_all_methods() {
        for kind in MethodKind::ALL {
            let desc = kind.descriptor();
            assert!(desc.name.starts_with(desc.class_name()));
            assert_eq!(ProtocolClass::from_id(desc.class_id()), Some(desc.class));
        }
        assert_eq!(MethodKind::ConnectionStart.ids(), (10, 10));
        assert_eq!(MethodKind::ConnectionCloseOk.ids(), (10, 51));
        assert_eq!(MethodKind::ChannelClose.ids(), (20, 40));
    }

    #[test]
    fn test_field_index() {
        let open = MethodKind::ConnectionOpen.descriptor();
        assert_eq!(open.field_index("virtual-host"), Some(0));
        assert_eq!(open.field_index("insist"), Some(2));
        assert_eq!(open.field_index("nope"), None);
        assert_eq!(open.to_string(), "connection.open (10/40)");
    }
}
