//! Descriptor documents over HTTP: what we serve on the transport port and
//! how we read a peer's friendly name back.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use mesh_core::wire::{CONTROLLER_URN, DEVICE_URN_PREFIX, PLAYER_URN, ROOT_URN, SERVER_URN};
use mesh_core::{NameFuture, NameResolver, Profile};
use roxmltree::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const MAX_REQUEST_LEN: usize = 8192;
const FETCH_TIMEOUT: Duration = Duration::from_secs(5);

/// What the HTTP side of the transport port publishes.
pub struct Site {
    profile: Arc<Profile>,
}

impl Site {
    pub fn new(profile: Arc<Profile>) -> Self {
        Self { profile }
    }
}

fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

/// Device description for `/Root.xml`, `/Player.xml`, `/Server.xml` or `/Controller.xml`.
pub fn descriptor(profile: &Profile, path: &str) -> Option<String> {
    let device_type = match path {
        "/Root.xml" => ROOT_URN,
        "/Player.xml" => PLAYER_URN,
        "/Server.xml" => SERVER_URN,
        "/Controller.xml" => CONTROLLER_URN,
        _ => return None,
    };
    Some(format!(
        "<?xml version=\"1.0\"?>\r\n\
         <root xmlns=\"urn:schemas-upnp-org:device-1-0\">\r\n \
         <specVersion>\r\n  <major>1</major>\r\n  <minor>0</minor>\r\n </specVersion>\r\n \
         <device>\r\n  \
         <deviceType>{}</deviceType>\r\n  \
         <friendlyName>{}</friendlyName>\r\n  \
         <manufacturer>PeerMesh</manufacturer>\r\n  \
         <modelName>peermesh</modelName>\r\n  \
         <UDN>uuid:{}</UDN>\r\n \
         </device>\r\n\
         </root>\r\n",
        device_type,
        escape(&profile.friendly_name()),
        escape(profile.identity()),
    ))
}

fn child_text<'a>(node: roxmltree::Node<'a, '_>, name: &str) -> Option<&'a str> {
    node.children()
        .find(|n| n.tag_name().name() == name)
        .and_then(|n| n.text())
}

/// First `friendlyName` belonging to a device whose type is one of ours.
pub fn friendly_name_from_descriptor(xml: &str) -> Option<String> {
    let doc = match Document::parse(xml) {
        Ok(doc) => doc,
        Err(e) => {
            tracing::debug!("unreadable descriptor: {}", e);
            return None;
        }
    };
    doc.descendants()
        .filter(|n| n.tag_name().name() == "device")
        .filter(|device| {
            child_text(*device, "deviceType")
                .is_some_and(|t| t.trim().starts_with(DEVICE_URN_PREFIX))
        })
        .find_map(|device| {
            let name = child_text(device, "friendlyName")?.trim();
            (!name.is_empty()).then(|| name.to_string())
        })
}

/// Map a request path into `folder`, refusing anything that would leave it.
pub fn content_path(folder: &Path, request: &str) -> Option<PathBuf> {
    let relative = Path::new(request.trim_start_matches('/'));
    if relative.as_os_str().is_empty() {
        return None;
    }
    if !relative
        .components()
        .all(|c| matches!(c, Component::Normal(_)))
    {
        return None;
    }
    Some(folder.join(relative))
}

fn content_type(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("xml") => "text/xml",
        Some("html") | Some("htm") => "text/html",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain",
        _ => "application/octet-stream",
    }
}

/// Parse the request line; returns (method, path without query).
fn parse_request(buf: &[u8]) -> Option<(String, String)> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);
    let status = req.parse(buf).ok()?;
    if !status.is_complete() {
        return None;
    }
    let method = req.method?.to_string();
    let path = req.path?;
    let path = path.split(['?', '#']).next().unwrap_or(path);
    Some((method, path.to_string()))
}

async fn respond<S: AsyncWrite + Unpin>(
    stream: &mut S,
    status: &str,
    content_type: &str,
    body: &[u8],
    head_only: bool,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {}\r\nServer: peermesh/1.0\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        status,
        content_type,
        body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    if !head_only {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

/// Answer one request whose first bytes (`prefix`) were already read.
pub async fn serve_request<S>(stream: &mut S, prefix: &[u8], site: &Site) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = prefix.to_vec();
    let mut chunk = [0u8; 1024];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        if buf.len() > MAX_REQUEST_LEN {
            return respond(stream, "431 Request Header Fields Too Large", "text/plain", b"", false).await;
        }
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    let Some((method, path)) = parse_request(&buf) else {
        return respond(stream, "400 Bad Request", "text/plain", b"", false).await;
    };
    let head_only = method.eq_ignore_ascii_case("HEAD");
    if !head_only && !method.eq_ignore_ascii_case("GET") {
        return respond(stream, "405 Method Not Allowed", "text/plain", b"", false).await;
    }
    tracing::debug!(%path, "http request");

    if let Some(xml) = descriptor(&site.profile, &path) {
        return respond(stream, "200 OK", "text/xml", xml.as_bytes(), head_only).await;
    }
    let file = site
        .profile
        .content_folder()
        .and_then(|folder| content_path(&folder, &path));
    if let Some(file) = file {
        if let Ok(body) = tokio::fs::read(&file).await {
            return respond(stream, "200 OK", content_type(&file), &body, head_only).await;
        }
    }
    respond(stream, "404 Not Found", "text/plain", b"", head_only).await
}

/// Fetches `/Root.xml` from a peer and reads its friendly name.
pub struct HttpNameResolver {
    client: reqwest::Client,
}

impl HttpNameResolver {
    pub fn new() -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(FETCH_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl NameResolver for HttpNameResolver {
    fn resolve(&self, host: &str, port: u16) -> NameFuture {
        let client = self.client.clone();
        let url = format!("http://{}:{}/Root.xml", host, port);
        Box::pin(async move {
            let response = match client.get(&url).send().await {
                Ok(r) => r,
                Err(e) => {
                    tracing::debug!(%url, "descriptor fetch failed: {}", e);
                    return None;
                }
            };
            let body = response.text().await.ok()?;
            friendly_name_from_descriptor(&body)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn profile(name: &str) -> Arc<Profile> {
        Arc::new(Profile::new("abc-123", Ipv4Addr::LOCALHOST, 7000, name))
    }

    #[test]
    fn descriptor_names_the_device() {
        let xml = descriptor(&profile("Kitchen & Bath"), "/Player.xml").unwrap();
        assert!(xml.contains("<deviceType>urn:schemas-peermesh-org:device:Player:1</deviceType>"));
        assert!(xml.contains("<friendlyName>Kitchen &amp; Bath</friendlyName>"));
        assert!(xml.contains("<UDN>uuid:abc-123</UDN>"));
        assert!(descriptor(&profile("x"), "/Other.xml").is_none());
    }

    #[test]
    fn friendly_name_comes_from_our_device() {
        let xml = "<root><device><deviceType>urn:schemas-upnp-org:device:MediaRenderer:1</deviceType>\
                   <friendlyName>TV</friendlyName></device>\
                   <device><deviceType>urn:schemas-peermesh-org:device:Root:1</deviceType>\
                   <friendlyName> Den &lt;2&gt; </friendlyName></device></root>";
        assert_eq!(friendly_name_from_descriptor(xml).as_deref(), Some("Den <2>"));
        assert_eq!(
            friendly_name_from_descriptor("<root><friendlyName>x</friendlyName></root>"),
            None
        );
    }

    #[test]
    fn friendly_name_reads_cdata_and_nested_devices() {
        let xml = "<?xml version=\"1.0\"?>\
                   <root xmlns=\"urn:schemas-upnp-org:device-1-0\">\
                   <device><deviceType>urn:schemas-upnp-org:device:MediaServer:1</deviceType>\
                   <friendlyName>NAS</friendlyName>\
                   <deviceList><device>\
                   <deviceType>urn:schemas-peermesh-org:device:Player:1</deviceType>\
                   <!-- <friendlyName>commented</friendlyName> -->\
                   <friendlyName><![CDATA[Attic <b> & co]]></friendlyName>\
                   </device></deviceList></device></root>";
        assert_eq!(
            friendly_name_from_descriptor(xml).as_deref(),
            Some("Attic <b> & co")
        );
    }

    #[test]
    fn malformed_descriptor_has_no_name() {
        let xml = "<root><device><deviceType>urn:schemas-peermesh-org:device:Root:1</deviceType>\
                   <friendlyName>Den</friendlyName>";
        assert_eq!(friendly_name_from_descriptor(xml), None);
        assert_eq!(friendly_name_from_descriptor(""), None);
    }

    #[test]
    fn own_descriptor_is_readable() {
        let xml = descriptor(&profile("Living Room"), "/Root.xml").unwrap();
        assert_eq!(friendly_name_from_descriptor(&xml).as_deref(), Some("Living Room"));
    }

    #[test]
    fn content_stays_inside_folder() {
        let folder = Path::new("/srv/mesh");
        assert_eq!(
            content_path(folder, "/icons/logo.png"),
            Some(PathBuf::from("/srv/mesh/icons/logo.png"))
        );
        assert_eq!(content_path(folder, "/../etc/passwd"), None);
        assert_eq!(content_path(folder, "/a/../../b"), None);
        assert_eq!(content_path(folder, "/"), None);
    }

    #[test]
    fn request_path_drops_query() {
        let (method, path) = parse_request(b"GET /Root.xml?x=1 HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(method, "GET");
        assert_eq!(path, "/Root.xml");
        assert!(parse_request(b"GET /Root.xml HTTP/1.1\r\n").is_none());
    }

    async fn exchange(request: &'static [u8], site: Site) -> String {
        let (mut client, mut server) = tokio::io::duplex(4096);
        let task = tokio::spawn(async move {
            let mut prefix = [0u8; 4];
            server.read_exact(&mut prefix).await.unwrap();
            serve_request(&mut server, &prefix, &site).await.unwrap();
        });
        client.write_all(request).await.unwrap();
        task.await.unwrap();
        let mut out = Vec::new();
        client.read_to_end(&mut out).await.unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn serves_root_descriptor() {
        let response = exchange(
            b"GET /Root.xml HTTP/1.1\r\nHost: x\r\n\r\n",
            Site::new(profile("Desk")),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.contains("Content-Type: text/xml"));
        assert!(response.contains("<friendlyName>Desk</friendlyName>"));
    }

    #[tokio::test]
    async fn unknown_path_is_not_found() {
        let response = exchange(
            b"GET /missing.png HTTP/1.1\r\nHost: x\r\n\r\n",
            Site::new(profile("Desk")),
        )
        .await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
    }
}
