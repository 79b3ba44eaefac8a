//! Per-protocol engine account construction.
//!
//! Every account's engine-level email is the full user tag, so counters and
//! limiter state address the same identity.

use crate::controller::builder::{is_2022_cipher, is_aead_cipher};
use crate::engine::{Account, EngineUser};
use crate::tag;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nc_panel::types::{NodeInfo, NodeType, UserInfo};
use nc_panel::PanelType;

pub fn build_users(
    panel_type: PanelType,
    node: &NodeInfo,
    users: &[UserInfo],
    inbound_tag: &str,
) -> anyhow::Result<Vec<EngineUser>> {
    match node.node_type {
        NodeType::V2ray | NodeType::Vmess | NodeType::Vless => {
            if node.enable_vless || node.node_type == NodeType::Vless {
                Ok(build_vless_users(node, users, inbound_tag))
            } else {
                Ok(build_vmess_users(users, inbound_tag))
            }
        }
        NodeType::Trojan => Ok(build_trojan_users(users, inbound_tag)),
        NodeType::Shadowsocks => Ok(build_ss_users(
            panel_type,
            users,
            &node.cipher,
            inbound_tag,
        )),
        NodeType::ShadowsocksPlugin => Ok(build_ss_plugin_users(panel_type, users, inbound_tag)),
        NodeType::DokodemoDoor => {
            anyhow::bail!("unsupported node type: {}", node.node_type)
        }
    }
}

fn build_vmess_users(users: &[UserInfo], inbound_tag: &str) -> Vec<EngineUser> {
    users
        .iter()
        .map(|user| EngineUser {
            email: tag::user_tag(inbound_tag, &user.email, user.uid),
            level: 0,
            account: Account::Vmess {
                uuid: user.uuid.clone(),
                security: "auto",
            },
        })
        .collect()
}

fn build_vless_users(node: &NodeInfo, users: &[UserInfo], inbound_tag: &str) -> Vec<EngineUser> {
    users
        .iter()
        .map(|user| EngineUser {
            email: tag::user_tag(inbound_tag, &user.email, user.uid),
            level: 0,
            account: Account::Vless {
                uuid: user.uuid.clone(),
                flow: node.vless_flow.clone(),
            },
        })
        .collect()
}

fn build_trojan_users(users: &[UserInfo], inbound_tag: &str) -> Vec<EngineUser> {
    users
        .iter()
        .map(|user| EngineUser {
            email: tag::user_tag(inbound_tag, &user.email, user.uid),
            level: 0,
            account: Account::Trojan {
                password: user.uuid.clone(),
            },
        })
        .collect()
}

fn build_ss_users(
    panel_type: PanelType,
    users: &[UserInfo],
    node_cipher: &str,
    inbound_tag: &str,
) -> Vec<EngineUser> {
    let cipher = node_cipher.to_lowercase();
    let mut out = Vec::with_capacity(users.len());
    for user in users {
        let email = tag::user_tag(inbound_tag, &user.email, user.uid);
        if is_2022_cipher(&cipher) {
            match ss2022_user_key(panel_type, &user.passwd, &cipher) {
                Ok(key) => out.push(EngineUser {
                    email,
                    level: 0,
                    account: Account::Shadowsocks2022 { key },
                }),
                Err(err) => {
                    tracing::error!(uid = user.uid, %err, "skipping shadowsocks user");
                }
            }
        } else {
            out.push(EngineUser {
                email,
                level: 0,
                account: Account::Shadowsocks {
                    password: user.passwd.clone(),
                    cipher: cipher.clone(),
                },
            });
        }
    }
    out
}

/// Shadowsocks-Plugin rosters carry a per-user cipher; only AEAD ciphers
/// (or the 2022 family) may register.
fn build_ss_plugin_users(
    panel_type: PanelType,
    users: &[UserInfo],
    inbound_tag: &str,
) -> Vec<EngineUser> {
    let mut out = Vec::with_capacity(users.len());
    for user in users {
        let email = tag::user_tag(inbound_tag, &user.email, user.uid);
        let cipher = user.method.to_lowercase();
        if is_2022_cipher(&cipher) {
            match ss2022_user_key(panel_type, &user.passwd, &cipher) {
                Ok(key) => out.push(EngineUser {
                    email,
                    level: 0,
                    account: Account::Shadowsocks2022 { key },
                }),
                Err(err) => {
                    tracing::error!(uid = user.uid, %err, "skipping shadowsocks user");
                }
            }
        } else if is_aead_cipher(&cipher) {
            out.push(EngineUser {
                email,
                level: 0,
                account: Account::Shadowsocks {
                    password: user.passwd.clone(),
                    cipher,
                },
            });
        } else {
            tracing::error!(uid = user.uid, %cipher, "non-AEAD cipher rejected at registration");
        }
    }
    out
}

/// The 2022 family keys users by PSK. V2board-family panels hand out plain
/// credentials, so the key is derived from the first 16/32 characters and
/// base64-encoded; other panels already send base64 key material.
fn ss2022_user_key(
    panel_type: PanelType,
    password: &str,
    cipher: &str,
) -> anyhow::Result<String> {
    if !panel_type.is_v2board_family() {
        return Ok(password.to_string());
    }
    let want = if cipher == "2022-blake3-aes-128-gcm" {
        16
    } else {
        32
    };
    if password.len() < want {
        anyhow::bail!("shadowsocks 2022 key must be at least {want} characters");
    }
    Ok(BASE64.encode(&password.as_bytes()[..want]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(node_type: NodeType) -> NodeInfo {
        NodeInfo {
            node_type,
            node_id: 1,
            port: 443,
            ..Default::default()
        }
    }

    fn roster_user(uid: i64) -> UserInfo {
        UserInfo {
            uid,
            email: format!("u{uid}@panel.user"),
            uuid: format!("uuid-{uid}"),
            passwd: format!("password-{uid}"),
            ..Default::default()
        }
    }

    #[test]
    fn vmess_email_is_the_user_tag() {
        let users = build_users(
            PanelType::Sspanel,
            &node(NodeType::V2ray),
            &[roster_user(1)],
            "Vmess_0.0.0.0_443",
        )
        .unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0].email, "Vmess_0.0.0.0_443|u1@panel.user|1");
        assert!(matches!(
            users[0].account,
            Account::Vmess { security: "auto", .. }
        ));
    }

    #[test]
    fn vless_carries_descriptor_flow() {
        let mut descriptor = node(NodeType::V2ray);
        descriptor.enable_vless = true;
        descriptor.vless_flow = "xtls-rprx-vision".into();
        let users =
            build_users(PanelType::NewV2board, &descriptor, &[roster_user(1)], "t").unwrap();
        match &users[0].account {
            Account::Vless { flow, .. } => assert_eq!(flow, "xtls-rprx-vision"),
            other => panic!("unexpected account: {other:?}"),
        }
    }

    #[test]
    fn trojan_password_is_the_credential() {
        let users =
            build_users(PanelType::Sspanel, &node(NodeType::Trojan), &[roster_user(1)], "t")
                .unwrap();
        match &users[0].account {
            Account::Trojan { password } => assert_eq!(password, "uuid-1"),
            other => panic!("unexpected account: {other:?}"),
        }
    }

    #[test]
    fn ss2022_v2board_truncates_and_encodes() {
        let key = ss2022_user_key(
            PanelType::NewV2board,
            "0123456789abcdefXXXX",
            "2022-blake3-aes-128-gcm",
        )
        .unwrap();
        assert_eq!(key, BASE64.encode(b"0123456789abcdef"));
        // Too short for the 256-bit variant.
        assert!(ss2022_user_key(
            PanelType::NewV2board,
            "0123456789abcdef",
            "2022-blake3-aes-256-gcm"
        )
        .is_err());
        // Other panels pass their key material through untouched.
        assert_eq!(
            ss2022_user_key(PanelType::Sspanel, "ready-made", "2022-blake3-aes-256-gcm").unwrap(),
            "ready-made"
        );
    }

    #[test]
    fn ss_plugin_rejects_non_aead() {
        let mut stream_user = roster_user(1);
        stream_user.method = "aes-256-gcm".into();
        let mut legacy_user = roster_user(2);
        legacy_user.method = "rc4-md5".into();
        let users = build_users(
            PanelType::Sspanel,
            &node(NodeType::ShadowsocksPlugin),
            &[stream_user, legacy_user],
            "t",
        )
        .unwrap();
        assert_eq!(users.len(), 1);
        match &users[0].account {
            Account::Shadowsocks { cipher, .. } => assert_eq!(cipher, "aes-256-gcm"),
            other => panic!("unexpected account: {other:?}"),
        }
    }

    #[test]
    fn short_2022_keys_are_skipped_not_fatal() {
        let mut descriptor = node(NodeType::Shadowsocks);
        descriptor.cipher = "2022-blake3-aes-256-gcm".into();
        let mut short = roster_user(1);
        short.passwd = "short".into();
        let mut long = roster_user(2);
        long.passwd = "0123456789abcdef0123456789abcdef".into();
        let users =
            build_users(PanelType::NewV2board, &descriptor, &[short, long], "t").unwrap();
        assert_eq!(users.len(), 1);
        assert!(users[0].email.ends_with("|2"));
    }
}
