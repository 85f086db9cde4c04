//! 证书模型
//!
//! 解析端点上的 PEM 证书链，只读取生命周期决策需要的信息：有效期与域名集合。

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::BTreeSet;
use x509_parser::extensions::GeneralName;
use x509_parser::pem::parse_x509_pem;

use crate::error::{Error, Result};

/// 签发结果：证书链与对应私钥
#[derive(Clone, PartialEq, Eq)]
pub struct CertificateBundle {
    /// 证书链（PEM 格式，叶子证书在前）
    pub certificate_pem: String,
    /// 私钥（PEM 格式）
    pub private_key_pem: String,
}

impl std::fmt::Debug for CertificateBundle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CertificateBundle")
            .field("certificate_pem", &self.certificate_pem.len())
            .field("private_key_pem", &"<redacted>")
            .finish()
    }
}

/// 叶子证书信息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// 生效时间
    pub not_before: DateTime<Utc>,
    /// 过期时间
    pub not_after: DateTime<Utc>,
    /// DNS SAN 与 subject CN，统一小写
    pub domains: BTreeSet<String>,
}

fn to_utc(timestamp: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_opt(timestamp, 0)
        .single()
        .ok_or_else(|| Error::Certificate(format!("证书时间超出范围: {}", timestamp)))
}

impl CertificateInfo {
    /// 从 PEM 证书链中解析叶子证书
    pub fn from_pem(pem: &str) -> Result<Self> {
        let (_, pem) = parse_x509_pem(pem.as_bytes())
            .map_err(|e| Error::Certificate(format!("无法解析 PEM: {}", e)))?;
        if pem.label != "CERTIFICATE" {
            return Err(Error::Certificate(format!("意外的 PEM 类型: {}", pem.label)));
        }
        let cert = pem
            .parse_x509()
            .map_err(|e| Error::Certificate(format!("无效的 X509 证书: {}", e)))?;

        let validity = cert.validity();
        let not_before = to_utc(validity.not_before.timestamp())?;
        let not_after = to_utc(validity.not_after.timestamp())?;

        let mut domains = BTreeSet::new();
        if let Ok(Some(san)) = cert.subject_alternative_name() {
            for name in &san.value.general_names {
                if let GeneralName::DNSName(dns) = name {
                    domains.insert(dns.to_ascii_lowercase());
                }
            }
        }
        for cn in cert.subject().iter_common_name() {
            if let Ok(cn) = cn.as_str() {
                if !cn.trim().is_empty() {
                    domains.insert(cn.trim().to_ascii_lowercase());
                }
            }
        }

        Ok(Self {
            not_before,
            not_after,
            domains,
        })
    }

    /// 在给定时刻是否处于有效期内
    pub fn is_valid_at(&self, now: DateTime<Utc>) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// 总有效期
    pub fn total_validity(&self) -> Duration {
        (self.not_after - self.not_before).max(Duration::zero())
    }

    /// 是否覆盖全部域名
    pub fn covers(&self, domains: &[String]) -> bool {
        domains.iter().all(|domain| self.covers_domain(domain))
    }

    fn covers_domain(&self, domain: &str) -> bool {
        let domain = domain.trim().to_ascii_lowercase();
        if self.domains.contains(&domain) {
            return true;
        }
        // 通配符只匹配单层标签
        match domain.split_once('.') {
            Some((label, parent)) if !label.is_empty() && !parent.is_empty() => {
                self.domains.contains(&format!("*.{}", parent))
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{date_time_ymd, CertificateParams, DistinguishedName, DnType, KeyPair};
    use rstest::rstest;

    fn self_signed(names: &[&str], cn: Option<&str>) -> String {
        let key = KeyPair::generate().unwrap();
        let names: Vec<String> = names.iter().map(|s| s.to_string()).collect();
        let mut params = CertificateParams::new(names).unwrap();
        params.not_before = date_time_ymd(2026, 1, 1);
        params.not_after = date_time_ymd(2026, 4, 1);
        params.distinguished_name = DistinguishedName::new();
        if let Some(cn) = cn {
            params.distinguished_name.push(DnType::CommonName, cn);
        }
        params.self_signed(&key).unwrap().pem()
    }

    #[test]
    fn test_round_trip_domains_and_validity() {
        let pem = self_signed(&["app.example.com", "WWW.example.com"], Some("app.example.com"));
        let info = CertificateInfo::from_pem(&pem).unwrap();

        assert_eq!(
            info.domains,
            ["app.example.com", "www.example.com"]
                .iter()
                .map(|s| s.to_string())
                .collect::<BTreeSet<_>>()
        );
        assert_eq!(info.not_before, Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap());
        assert_eq!(info.not_after, Utc.with_ymd_and_hms(2026, 4, 1, 0, 0, 0).unwrap());
        assert_eq!(info.total_validity(), Duration::days(90));
    }

    #[test]
    fn test_common_name_counts_as_domain() {
        let pem = self_signed(&[], Some("legacy.example.com"));
        let info = CertificateInfo::from_pem(&pem).unwrap();
        assert!(info.covers(&["legacy.example.com".to_string()]));
    }

    #[test]
    fn test_validity_window_bounds() {
        let pem = self_signed(&["a.example.com"], None);
        let info = CertificateInfo::from_pem(&pem).unwrap();

        assert!(info.is_valid_at(info.not_before));
        assert!(info.is_valid_at(info.not_after));
        assert!(!info.is_valid_at(info.not_before - Duration::seconds(1)));
        assert!(!info.is_valid_at(info.not_after + Duration::seconds(1)));
    }

    #[rstest]
    #[case("a.example.com", true)]
    #[case("A.Example.Com", true)]
    #[case("b.example.com", true)]
    #[case("example.com", false)]
    #[case("x.b.example.com", false)]
    #[case("other.org", false)]
    fn test_wildcard_coverage(#[case] domain: &str, #[case] expected: bool) {
        let pem = self_signed(&["a.example.com", "*.example.com"], None);
        let info = CertificateInfo::from_pem(&pem).unwrap();
        assert_eq!(info.covers(&[domain.to_string()]), expected);
    }

    #[rstest]
    #[case("")]
    #[case("garbage")]
    #[case("-----BEGIN CERTIFICATE-----\nAAAA\n-----END CERTIFICATE-----\n")]
    fn test_unreadable_certificate(#[case] pem: &str) {
        assert!(CertificateInfo::from_pem(pem).is_err());
    }

    #[test]
    fn test_private_key_is_not_a_certificate() {
        let key = KeyPair::generate().unwrap();
        let err = CertificateInfo::from_pem(&key.serialize_pem()).unwrap_err();
        assert!(matches!(err, Error::Certificate(_)));
    }

    #[test]
    fn test_bundle_debug_hides_key() {
        let bundle = CertificateBundle {
            certificate_pem: "CERT".into(),
            private_key_pem: "SECRET".into(),
        };
        assert!(!format!("{:?}", bundle).contains("SECRET"));
    }
}
