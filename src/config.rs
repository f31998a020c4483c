//! Session configuration: the XML document the launcher pipes in on stdin,
//! framed as `<decimal length>\n<bytes>`.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound on the framed document; anything larger is a protocol error.
const MAX_CONFIG_BYTES: u64 = 1 << 20;

const CENSORED: &str = "(censored)";

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename = "config")]
pub struct Config {
    #[serde(rename = "image", default)]
    pub images: Vec<ImageConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ImageConfig {
    pub name: String,
    /// Image size at session start, bytes.
    pub size: u64,
    pub origin: OriginConfig,
    pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OriginConfig {
    pub url: String,
    /// Added to every range request; nonzero when the image is embedded in
    /// a larger file.
    #[serde(default)]
    pub offset: u64,
    /// If nonzero, the origin file is split across `<url>.0, <url>.1, ...`
    /// in segments of this many bytes.
    #[serde(rename = "segment-size", default)]
    pub segment_size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub validators: Option<ValidatorsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credentials: Option<CredentialsConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookies: Option<CookiesConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ValidatorsConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
    /// Epoch seconds.
    #[serde(rename = "last-modified", skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CredentialsConfig {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CookiesConfig {
    #[serde(rename = "cookie", default)]
    pub cookies: Vec<String>,
}

impl Config {
    pub fn from_xml(text: &str) -> Result<Self, ConfigError> {
        let config: Config =
            quick_xml::de::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Read one `<length>\n<bytes>` framed document.
    pub async fn read_framed<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Self, ConfigError> {
        let mut header = String::new();
        reader.read_line(&mut header).await?;
        let length: u64 = header
            .trim()
            .parse()
            .map_err(|_| ConfigError::Parse(format!("bad length header {header:?}")))?;
        if length > MAX_CONFIG_BYTES {
            return Err(ConfigError::Parse(format!(
                "configuration too large: {length} bytes"
            )));
        }
        let mut body = vec![0u8; length as usize];
        reader.read_exact(&mut body).await?;
        let text =
            String::from_utf8(body).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Self::from_xml(&text)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.images.is_empty() {
            return Err(ConfigError::Invalid("no images configured".into()));
        }
        let mut names = std::collections::HashSet::new();
        for image in &self.images {
            if image.name.is_empty() || image.name.contains('/') {
                return Err(ConfigError::Invalid(format!(
                    "bad image name {:?}",
                    image.name
                )));
            }
            if !names.insert(&image.name) {
                return Err(ConfigError::Invalid(format!(
                    "duplicate image name {:?}",
                    image.name
                )));
            }
            if image.origin.url.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "image {:?} has no origin url",
                    image.name
                )));
            }
            let chunk_size = image.cache.chunk_size;
            if chunk_size == 0 || !chunk_size.is_power_of_two() {
                return Err(ConfigError::Invalid(format!(
                    "chunk size {chunk_size} is not a power of two"
                )));
            }
        }
        Ok(())
    }

    /// The document re-rendered for the `/config` file, with credential and
    /// cookie values censored.
    pub fn censored_xml(&self) -> String {
        let mut copy = self.clone();
        for image in &mut copy.images {
            if let Some(credentials) = &mut image.origin.credentials {
                credentials.password = CENSORED.into();
            }
            if let Some(cookies) = &mut image.origin.cookies {
                for cookie in &mut cookies.cookies {
                    *cookie = CENSORED.into();
                }
            }
        }
        let body = quick_xml::se::to_string(&copy).unwrap_or_default();
        format!("{body}\n")
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    pub path: PathBuf,
    #[serde(rename = "chunk-size")]
    pub chunk_size: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<config xmlns="http://olivearchive.org/xmlns/vmnetx/vmnetfs">
  <image>
    <name>disk</name>
    <size>1048576</size>
    <origin>
      <url>https://origin.example/vm/disk</url>
      <offset>4096</offset>
      <validators>
        <etag>"v1"</etag>
        <last-modified>1358956800</last-modified>
      </validators>
      <credentials>
        <username>alice</username>
        <password>hunter2</password>
      </credentials>
      <cookies>
        <cookie>session=abc123; Domain=origin.example; Path=/</cookie>
      </cookies>
    </origin>
    <cache>
      <path>/var/cache/vmnetfs/disk</path>
      <chunk-size>131072</chunk-size>
    </cache>
  </image>
  <image>
    <name>memory</name>
    <size>262144</size>
    <origin>
      <url>https://origin.example/vm/memory</url>
    </origin>
    <cache>
      <path>/var/cache/vmnetfs/memory</path>
      <chunk-size>131072</chunk-size>
    </cache>
  </image>
</config>
"#;

    #[test]
    fn test_parse_full_document() {
        let config = Config::from_xml(SAMPLE).unwrap();
        assert_eq!(config.images.len(), 2);

        let disk = &config.images[0];
        assert_eq!(disk.name, "disk");
        assert_eq!(disk.size, 1048576);
        assert_eq!(disk.origin.offset, 4096);
        assert_eq!(disk.origin.segment_size, 0);
        let validators = disk.origin.validators.as_ref().unwrap();
        assert_eq!(validators.etag.as_deref(), Some("\"v1\""));
        assert_eq!(validators.last_modified, Some(1358956800));
        assert_eq!(
            disk.origin.credentials.as_ref().unwrap().username,
            "alice"
        );
        assert_eq!(disk.cache.chunk_size, 131072);

        let memory = &config.images[1];
        assert!(memory.origin.validators.is_none());
        assert_eq!(memory.origin.offset, 0);
    }

    #[test]
    fn test_rejects_bad_chunk_size() {
        let text = SAMPLE.replace("131072", "1000");
        assert!(matches!(
            Config::from_xml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_rejects_duplicate_names() {
        let text = SAMPLE.replace("<name>memory</name>", "<name>disk</name>");
        assert!(matches!(
            Config::from_xml(&text),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_censored_xml_hides_secrets() {
        let config = Config::from_xml(SAMPLE).unwrap();
        let censored = config.censored_xml();
        assert!(!censored.contains("hunter2"));
        assert!(!censored.contains("abc123"));
        assert!(censored.contains("alice"), "usernames stay visible");
        assert!(censored.contains("https://origin.example/vm/disk"));
        // Cookie elements stay in place with their values blanked, the
        // same treatment the password gets.
        assert!(censored.contains("<cookie>"));
    }

    #[tokio::test]
    async fn test_read_framed() {
        let body = SAMPLE.as_bytes();
        let mut framed = format!("{}\n", body.len()).into_bytes();
        framed.extend_from_slice(body);
        let mut reader = std::io::Cursor::new(framed);
        let config = Config::read_framed(&mut reader).await.unwrap();
        assert_eq!(config.images.len(), 2);
    }

    #[tokio::test]
    async fn test_read_framed_rejects_bad_header() {
        let mut reader = std::io::Cursor::new(b"nonsense\n".to_vec());
        assert!(matches!(
            Config::read_framed(&mut reader).await,
            Err(ConfigError::Parse(_))
        ));
    }
}
