//! Translate a node descriptor plus controller configuration into the
//! engine's inbound and outbound handler configs.

use crate::cert::CertService;
use crate::engine::{
    Fallback, InboundConfig, InboundSettings, OutboundConfig, RealitySettings, Security,
    SniffingSettings, StreamSettings, TlsSettings,
};
use anyhow::{bail, Context};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use nc_config::ControllerConfig;
use nc_panel::types::{NodeInfo, NodeType, Transport};
use rand::RngCore;

/// Ciphers of the shadowsocks 2022 family (PSK-based, base64 keys).
pub fn is_2022_cipher(cipher: &str) -> bool {
    matches!(
        cipher,
        "2022-blake3-aes-128-gcm" | "2022-blake3-aes-256-gcm" | "2022-blake3-chacha20-poly1305"
    )
}

/// Classic AEAD ciphers accepted for per-user shadowsocks accounts.
pub fn is_aead_cipher(cipher: &str) -> bool {
    matches!(
        cipher,
        "aes-128-gcm"
            | "aead_aes_128_gcm"
            | "aes-256-gcm"
            | "aead_aes_256_gcm"
            | "chacha20-poly1305"
            | "aead_chacha20_poly1305"
            | "chacha20-ietf-poly1305"
            | "xchacha20-poly1305"
    )
}

pub fn build_inbound(
    config: &ControllerConfig,
    node: &NodeInfo,
    tag: &str,
) -> anyhow::Result<InboundConfig> {
    // Shadowsocks-Plugin pairs with a loopback dokodemo inbound, so the
    // shadowsocks side itself must not be reachable from outside.
    let listen = if node.node_type == NodeType::ShadowsocksPlugin {
        "127.0.0.1".to_string()
    } else {
        config.listen_ip.clone()
    };

    let settings = build_settings(config, node)?;

    let mut sniffing = SniffingSettings::default();
    if config.disable_sniffing {
        sniffing.enabled = false;
    }

    let mut stream = StreamSettings {
        network: node.transport,
        host: node.host.clone(),
        path: node.path.clone(),
        service_name: node.service_name.clone(),
        authority: node.authority.clone(),
        header: node.header.clone(),
        ..Default::default()
    };
    match node.transport {
        Transport::Tcp | Transport::Ws => {
            stream.accept_proxy_protocol = config.enable_proxy_protocol;
        }
        _ => {
            // Other transports take proxy-protocol at the socket.
            stream.sockopt_proxy_protocol = config.enable_proxy_protocol;
        }
    }
    stream.security = build_security(config, node)?;

    Ok(InboundConfig {
        tag: tag.to_string(),
        listen,
        port: node.port,
        settings,
        stream,
        sniffing,
    })
}

fn build_settings(config: &ControllerConfig, node: &NodeInfo) -> anyhow::Result<InboundSettings> {
    Ok(match node.node_type {
        NodeType::V2ray | NodeType::Vmess | NodeType::Vless => {
            if node.enable_vless || node.node_type == NodeType::Vless {
                InboundSettings::Vless {
                    decryption: "none",
                    fallbacks: if config.enable_fallback {
                        build_fallbacks(config)?
                    } else {
                        Vec::new()
                    },
                }
            } else {
                InboundSettings::Vmess
            }
        }
        NodeType::Trojan => InboundSettings::Trojan {
            fallbacks: if config.enable_fallback {
                build_fallbacks(config)?
            } else {
                Vec::new()
            },
        },
        NodeType::Shadowsocks | NodeType::ShadowsocksPlugin => {
            let cipher = node.cipher.to_lowercase();
            let mut random = [0u8; 32];
            rand::thread_rng().fill_bytes(&mut random);
            let (password, extra_psks) = if is_2022_cipher(&cipher) {
                // 2022 multi-user: the node PSK is the shared key; seed the
                // user table with one generated PSK.
                (node.server_key.clone(), vec![BASE64.encode(random)])
            } else {
                // Classic shadowsocks needs an unguessable server password.
                (hex::encode(random), Vec::new())
            };
            InboundSettings::Shadowsocks {
                cipher,
                password,
                extra_psks,
                iv_check: !config.disable_iv_check,
                networks: vec!["tcp", "udp"],
            }
        }
        NodeType::DokodemoDoor => InboundSettings::DokodemoDoor {
            address: "v1.mux.cool".to_string(),
            networks: vec!["tcp", "udp"],
        },
    })
}

fn build_security(config: &ControllerConfig, node: &NodeInfo) -> anyhow::Result<Security> {
    if config.enable_reality && node.enable_reality {
        // Descriptor parameters win; the config block fills the gaps for
        // panels that only flag REALITY on.
        let params = node.reality.clone();
        let (dest, xver, server_names, private_key, min_cv, max_cv, max_td, short_ids) =
            match params {
                Some(r) => (
                    r.dest,
                    r.proxy_protocol_ver,
                    r.server_names,
                    r.private_key,
                    r.min_client_ver,
                    r.max_client_ver,
                    r.max_time_diff,
                    r.short_ids,
                ),
                None => {
                    let r = &config.reality;
                    (
                        r.dest.clone(),
                        r.proxy_protocol_ver,
                        r.server_names.clone(),
                        r.private_key.clone(),
                        r.min_client_ver.clone(),
                        r.max_client_ver.clone(),
                        r.max_time_diff,
                        r.short_ids.clone(),
                    )
                }
            };
        if dest.is_empty() || private_key.is_empty() {
            bail!("REALITY enabled but dest or private key is missing");
        }
        return Ok(Security::Reality(RealitySettings {
            show: config.reality.show,
            dest,
            xver,
            server_names,
            private_key,
            min_client_ver: min_cv,
            max_client_ver: max_cv,
            max_time_diff: max_td,
            short_ids,
        }));
    }

    if node.enable_tls && config.cert_config.cert_mode != "none" {
        let cert = CertService::new(&config.cert_config);
        let (cert_file, key_file) = cert
            .cert_paths()
            .context("resolve certificate for TLS inbound")?;
        return Ok(Security::Tls(TlsSettings {
            cert_file: cert_file.display().to_string(),
            key_file: key_file.display().to_string(),
            reject_unknown_sni: config.cert_config.reject_unknown_sni,
            ocsp_stapling: 3600,
        }));
    }

    Ok(Security::None)
}

fn build_fallbacks(config: &ControllerConfig) -> anyhow::Result<Vec<Fallback>> {
    if config.fallbacks.is_empty() {
        bail!("fallback enabled but no fallback configured");
    }
    config
        .fallbacks
        .iter()
        .map(|f| {
            if f.dest.is_empty() {
                bail!("dest is required for fallback");
            }
            Ok(Fallback {
                sni: f.sni.clone(),
                alpn: f.alpn.clone(),
                path: f.path.clone(),
                dest: f.dest.clone(),
                xver: f.proxy_protocol_ver,
            })
        })
        .collect()
}

/// Freedom outbound, tagged like its inbound.
pub fn build_outbound(config: &ControllerConfig, node: &NodeInfo, tag: &str) -> OutboundConfig {
    let domain_strategy = if config.enable_dns {
        if config.dns_type.is_empty() {
            "UseIP".to_string()
        } else {
            config.dns_type.clone()
        }
    } else {
        "AsIs".to_string()
    };
    let redirect = (node.node_type == NodeType::DokodemoDoor)
        .then(|| format!("127.0.0.1:{}", node.port - 1));
    OutboundConfig {
        tag: tag.to_string(),
        send_through: config.send_ip.clone(),
        domain_strategy,
        redirect,
    }
}
