//! The compound keys shared by the engine, limiter and rule manager.
//!
//! Inbound tags and user tags are built here and nowhere else: engine
//! emails, limiter maps and incident records all address the same user
//! through the same string.

use nc_panel::types::NodeType;

/// `{protocol}_{listen_ip}_{port}`
pub fn inbound_tag(node_type: NodeType, listen_ip: &str, port: u32) -> String {
    format!("{}_{}_{}", node_type, listen_ip, port)
}

/// `{inbound_tag}|{email}|{uid}` — the engine-level email of a user.
pub fn user_tag(inbound_tag: &str, email: &str, uid: i64) -> String {
    format!("{inbound_tag}|{email}|{uid}")
}

/// Tag of the dokodemo-door companion inbound used by Shadowsocks-Plugin.
pub fn dokodemo_tag(inbound_tag: &str) -> String {
    format!("dokodemo-door_{inbound_tag}+1")
}

/// Extract the trailing numeric uid from a user tag.
pub fn uid_of_user_tag(tag: &str) -> Option<i64> {
    tag.rsplit('|').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tags_compose_and_parse() {
        let tag = inbound_tag(NodeType::Vmess, "0.0.0.0", 10086);
        assert_eq!(tag, "Vmess_0.0.0.0_10086");
        let utag = user_tag(&tag, "a@b.c", 42);
        assert_eq!(utag, "Vmess_0.0.0.0_10086|a@b.c|42");
        assert_eq!(uid_of_user_tag(&utag), Some(42));
        assert_eq!(dokodemo_tag(&tag), "dokodemo-door_Vmess_0.0.0.0_10086+1");
    }

    #[test]
    fn uid_parse_failures() {
        assert_eq!(uid_of_user_tag("tag|mail|notanumber"), None);
        assert_eq!(uid_of_user_tag(""), None);
    }
}
