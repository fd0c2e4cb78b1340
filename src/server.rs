//! Speed test server descriptors and discovery ranking.

use crate::error::{MeasurementError, Result};
use serde::Deserialize;
use std::fmt;

/// A remote measurement endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Server {
    pub id: u32,
    /// `name:port` of the endpoint, used as the latency label.
    pub host: String,
    /// Upload endpoint, e.g. `http://speedtest.example.net:8080/speedtest/upload.php`.
    pub url: String,
    pub name: String,
    pub country: String,
    pub sponsor: String,
    /// Distance from the client in km, as reported by the directory.
    pub distance: Option<f64>,
}

impl Server {
    /// Directory the server's test files live in (the upload URL minus its last segment).
    pub fn base_url(&self) -> Result<&str> {
        match self.url.rsplit_once('/') {
            Some((base, _)) if base.contains("://") && !base.ends_with('/') => Ok(base),
            _ => Err(MeasurementError::InvalidUrl(self.url.clone())),
        }
    }

    pub fn latency_url(&self) -> Result<String> {
        Ok(format!("{}/latency.txt", self.base_url()?))
    }

    pub fn download_url(&self, size: u32) -> Result<String> {
        Ok(format!("{}/random{}x{}.jpg", self.base_url()?, size, size))
    }
}

impl fmt::Display for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}, {}) [{}]", self.sponsor, self.name, self.country, self.id)?;
        if let Some(d) = self.distance {
            write!(f, " {:.1} km", d)?;
        }
        Ok(())
    }
}

/// Servers in provider ranking order.
#[derive(Debug, Clone, Default)]
pub struct ServerList {
    servers: Vec<Server>,
}

impl ServerList {
    /// Servers with a known distance are ranked nearest first; the rest keep
    /// provider order after them.
    pub fn new(mut servers: Vec<Server>) -> Self {
        servers.sort_by(|a, b| match (a.distance, b.distance) {
            (Some(a), Some(b)) => a.total_cmp(&b),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });
        Self { servers }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Server> {
        self.servers.iter()
    }

    /// Candidates in ranking order, skipping any id in `exclude`.
    pub fn find_servers(&self, exclude: &[u32]) -> Result<Vec<&Server>> {
        let candidates: Vec<&Server> = self
            .servers
            .iter()
            .filter(|s| !exclude.contains(&s.id))
            .collect();
        if candidates.is_empty() {
            return Err(MeasurementError::NoServers);
        }
        Ok(candidates)
    }
}

impl FromIterator<Server> for ServerList {
    fn from_iter<I: IntoIterator<Item = Server>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

/// The directory sends ids and distances either as strings or numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Loose {
    Number(f64),
    Text(String),
}

impl Loose {
    fn as_f64(&self) -> Option<f64> {
        match self {
            Loose::Number(n) => Some(*n),
            Loose::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct DirectoryEntry {
    id: Loose,
    #[serde(default)]
    url: String,
    #[serde(default)]
    host: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    country: String,
    #[serde(default)]
    sponsor: String,
    #[serde(default)]
    distance: Option<Loose>,
}

impl DirectoryEntry {
    fn into_server(self) -> Option<Server> {
        let id = self.id.as_f64().filter(|n| *n >= 0.0 && n.fract() == 0.0)? as u32;
        if self.host.is_empty() || self.url.is_empty() {
            return None;
        }
        Some(Server {
            id,
            host: self.host,
            url: self.url,
            name: self.name,
            country: self.country,
            sponsor: self.sponsor,
            distance: self.distance.as_ref().and_then(Loose::as_f64),
        })
    }
}

/// Decodes directory entries one at a time, dropping any that are malformed
/// or lack an id, host or URL.
pub(crate) fn parse_directory(entries: Vec<serde_json::Value>) -> Vec<Server> {
    entries
        .into_iter()
        .filter_map(|entry| match serde_json::from_value::<DirectoryEntry>(entry) {
            Ok(entry) => entry.into_server(),
            Err(e) => {
                tracing::debug!("Unreadable directory entry: {}", e);
                None
            }
        })
        .collect()
}

#[cfg(test)]
pub(crate) fn test_server(id: u32, host: &str, distance: Option<f64>) -> Server {
    Server {
        id,
        host: host.to_string(),
        url: format!("http://{}/speedtest/upload.php", host),
        name: "Testville".to_string(),
        country: "Testland".to_string(),
        sponsor: "Test ISP".to_string(),
        distance,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ranks_nearest_first() {
        let list = ServerList::new(vec![
            test_server(1, "far:8080", Some(300.0)),
            test_server(2, "unknown:8080", None),
            test_server(3, "near:8080", Some(12.5)),
        ]);
        let ids: Vec<u32> = list.iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![3, 1, 2]);
    }

    #[test]
    fn find_servers_with_empty_exclusion_keeps_everything() {
        let list = ServerList::new(vec![
            test_server(1, "a:8080", Some(2.0)),
            test_server(2, "b:8080", Some(1.0)),
        ]);
        let found = list.find_servers(&[]).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].id, 2);
    }

    #[test]
    fn find_servers_excludes_ids() {
        let list = ServerList::new(vec![
            test_server(1, "a:8080", Some(1.0)),
            test_server(2, "b:8080", Some(2.0)),
        ]);
        let found = list.find_servers(&[1]).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].host, "b:8080");
    }

    #[test]
    fn find_servers_errors_when_empty() {
        let list = ServerList::default();
        assert!(matches!(
            list.find_servers(&[]),
            Err(MeasurementError::NoServers)
        ));

        let list = ServerList::new(vec![test_server(7, "a:8080", None)]);
        assert!(matches!(
            list.find_servers(&[7]),
            Err(MeasurementError::NoServers)
        ));
    }

    #[test]
    fn derives_test_file_urls() {
        let server = test_server(1, "speed.example.net:8080", None);
        assert_eq!(
            server.base_url().unwrap(),
            "http://speed.example.net:8080/speedtest"
        );
        assert_eq!(
            server.latency_url().unwrap(),
            "http://speed.example.net:8080/speedtest/latency.txt"
        );
        assert_eq!(
            server.download_url(2000).unwrap(),
            "http://speed.example.net:8080/speedtest/random2000x2000.jpg"
        );
    }

    #[test]
    fn rejects_url_without_path() {
        let mut server = test_server(1, "x:8080", None);
        server.url = "upload.php".to_string();
        assert!(matches!(
            server.base_url(),
            Err(MeasurementError::InvalidUrl(_))
        ));
    }

    #[test]
    fn parses_directory_entries_with_mixed_types() {
        let json = r#"[
            {"url":"http://a.example:8080/speedtest/upload.php","lat":"1","lon":"2",
             "distance":14,"name":"Alpha","country":"X","cc":"XX","sponsor":"ISP A",
             "id":"4242","preferred":0,"https_functional":1,"host":"a.example:8080"},
            {"url":"http://b.example:8080/speedtest/upload.php","distance":"3",
             "id":17,"host":"b.example:8080"},
            {"url":"http://c.example/upload.php","id":"not-a-number","host":"c.example"}
        ]"#;
        let entries: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
        let list = ServerList::new(parse_directory(entries));

        assert_eq!(list.len(), 2);
        let first = list.iter().next().unwrap();
        assert_eq!(first.id, 17);
        assert_eq!(first.distance, Some(3.0));
        let second = list.iter().nth(1).unwrap();
        assert_eq!(second.id, 4242);
        assert_eq!(second.sponsor, "ISP A");
    }

    #[test]
    fn incomplete_directory_entries_do_not_hide_valid_ones() {
        let json = r#"[
            {"url":"http://a.example:8080/speedtest/upload.php","id":"1","host":"a.example:8080"},
            {"url":"http://b.example:8080/speedtest/upload.php","id":"2"},
            {"id":"3","host":"c.example:8080"},
            {"url":"http://d.example/upload.php","id":"4","host":""},
            {"url":42,"id":"5","host":"e.example:8080"},
            "not an object"
        ]"#;
        let entries: Vec<serde_json::Value> = serde_json::from_str(json).unwrap();
        let servers = parse_directory(entries);

        assert_eq!(servers.len(), 1);
        assert_eq!(servers[0].id, 1);
        assert_eq!(servers[0].host, "a.example:8080");
    }
}
