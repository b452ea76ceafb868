use super::{MetricsError, PerfMetrics};
use crate::config::YarnConfig;
use http::Uri;
use reqwest::{
    blocking::{Client, Response},
    header::{ACCEPT, CONTENT_TYPE},
};
use serde::Deserialize;
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    process::{Command, Stdio},
    time::Duration,
};
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

pub const YARN_SITE: &str = "yarn-site.xml";
pub const YARN_CLI: &str = "yarn";
pub const ROUTE_INFO: &str = "/ws/v1/cluster/info";
pub const ROUTE_APPS: &str = "/ws/v1/cluster/apps/";

const JSON: &str = "application/json";
const RM_ADDRESS: &str = "yarn.resourcemanager.address";
const RM_WEBAPP_ADDRESS: &str = "yarn.resourcemanager.webapp.address";
const RM_HA_ENABLED: &str = "yarn.resourcemanager.ha.enabled";
const HTTP_POLICY: &str = "yarn.http.policy";

#[derive(Debug, Deserialize)]
struct AppResponse {
    app: AppInfo,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AppInfo {
    memory_seconds: f64,
    vcore_seconds: f64,
    /// milliseconds
    elapsed_time: u64,
}

/// Reads application metrics from a YARN resource manager
#[derive(Debug, Clone)]
pub struct YarnMetrics {
    client: Client,
    base: String,
    /// `yarn` command line tool used to kill applications
    cli: PathBuf,
}

impl YarnMetrics {
    /// Client for the resource manager at `uri`, without checking that it is up
    pub fn new(uri: Uri, timeout: Duration) -> Result<Self, MetricsError> {
        let client = Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base: uri.to_string().trim_end_matches('/').to_string(),
            cli: PathBuf::from(YARN_CLI),
        })
    }

    pub fn with_cli(mut self, cli: impl Into<PathBuf>) -> Self {
        self.cli = cli.into();
        self
    }

    /// Client for a resource manager that answered the cluster info route
    pub fn connect(uri: Uri, timeout: Duration) -> Result<Self, MetricsError> {
        let metrics = Self::new(uri, timeout)?;

        match metrics.cluster_info() {
            Ok(info) => {
                info!("YARN cluster info: {info}");

                Ok(metrics)
            }
            Err(e) => {
                warn!(error = ?e, "Resource manager did not answer");

                Err(MetricsError::Unreachable(metrics.base))
            }
        }
    }

    /// Connect to the configured resource manager, or the one named in yarn-site.xml
    pub fn load(config: &YarnConfig) -> Result<Self, MetricsError> {
        let uri = match config.resource_manager {
            Some(ref uri) => uri.clone(),
            None => {
                let path = find_yarn_site(config.conf_dir.as_deref())
                    .ok_or(MetricsError::MissingYarnSite)?;
                debug!("Reading YARN properties from {}", path.to_string_lossy());

                resource_manager_uri(&read_properties(&fs::read_to_string(path)?))?
            }
        };

        Ok(Self::connect(uri, config.request_timeout())?.with_cli(&config.cli))
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn cli(&self) -> &Path {
        &self.cli
    }

    /// `yarn application -kill`, waiting at most `timeout`
    pub fn kill_application(&self, application_id: &str, timeout: Duration) -> bool {
        kill_application(&self.cli, application_id, timeout)
    }

    fn get(&self, route: &str) -> Result<Response, MetricsError> {
        let response = self
            .client
            .get(format!("{}{route}", self.base))
            .header(ACCEPT, JSON)
            .send()?
            .error_for_status()?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or_default();

        // only json is accepted, a charset parameter is fine
        if content_type.split(';').next().map(str::trim) != Some(JSON) {
            return Err(MetricsError::ContentType(content_type.to_string()));
        }

        debug!("YARN RM call to {route}: {}", response.status());

        Ok(response)
    }

    pub fn cluster_info(&self) -> Result<serde_json::Value, MetricsError> {
        Ok(self.get(ROUTE_INFO)?.json()?)
    }

    #[instrument(level = "debug", skip(self))]
    pub fn get_perf_metrics(&self, application_id: &str) -> Result<PerfMetrics, MetricsError> {
        let response: AppResponse = self.get(&format!("{ROUTE_APPS}{application_id}"))?.json()?;

        Ok(PerfMetrics {
            memory_seconds: response.app.memory_seconds,
            vcore_seconds: response.app.vcore_seconds,
            elapsed: Duration::from_millis(response.app.elapsed_time),
        })
    }
}

/// `yarn-site.xml` in the given directory, else in `YARN_CONF_DIR`, else in
/// `HADOOP_CONF_DIR`. The first directory that is set decides.
pub fn find_yarn_site(conf_dir: Option<&Path>) -> Option<PathBuf> {
    let conf_dir = conf_dir.map(Path::to_path_buf).or_else(|| {
        env::var_os("YARN_CONF_DIR")
            .or_else(|| env::var_os("HADOOP_CONF_DIR"))
            .map(PathBuf::from)
    })?;
    let yarn_site = conf_dir.join(YARN_SITE);

    yarn_site.is_file().then_some(yarn_site)
}

/// position right after the opening `<tag>` or `<tag attr="...">`
fn open_tag(block: &str, tag: &str) -> Option<usize> {
    let open = format!("<{tag}");
    let mut offset = 0;

    while let Some(found) = block[offset..].find(&open) {
        let after = offset + found + open.len();
        let rest = &block[after..];

        if rest.starts_with('>') || rest.starts_with(char::is_whitespace) {
            let end = after + rest.find('>')?;

            // `<tag />` has no content
            if !block[..end].ends_with('/') {
                return Some(end + 1);
            }
        }
        offset = after;
    }

    None
}

fn element<'a>(block: &'a str, tag: &str) -> Option<&'a str> {
    let close = format!("</{tag}>");
    let start = open_tag(block, tag)?;
    let end = start + block[start..].find(&close)?;

    Some(block[start..end].trim())
}

/// element text, CDATA sections are taken verbatim
fn text(content: &str) -> String {
    match content
        .strip_prefix("<![CDATA[")
        .and_then(|cdata| cdata.strip_suffix("]]>"))
    {
        Some(raw) => raw.to_string(),
        None => unescape(content),
    }
}

fn unescape(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}

/// `name -> value` of every `<property>` in a Hadoop configuration file.
///
/// Tags may carry attributes and values may be CDATA sections. Entity and
/// character references beyond the five predefined entities, as well as
/// mixed text and CDATA inside one value, are not supported.
pub fn read_properties(xml: &str) -> BTreeMap<String, String> {
    let mut uncommented = String::with_capacity(xml.len());
    let mut rest = xml;

    while let Some(start) = rest.find("<!--") {
        uncommented.push_str(&rest[..start]);
        rest = match rest[start..].find("-->") {
            Some(end) => &rest[start + end + 3..],
            None => "",
        };
    }
    uncommented.push_str(rest);

    let mut properties = BTreeMap::new();
    let mut rest = uncommented.as_str();

    while let Some(start) = open_tag(rest, "property") {
        let block = &rest[start..];
        let end = block.find("</property>").unwrap_or(block.len());

        if let (Some(name), Some(value)) = (element(&block[..end], "name"), element(&block[..end], "value")) {
            properties.insert(text(name), text(value));
        }
        rest = &block[end..];
    }

    properties
}

/// `(scheme, default port)` for the configured `yarn.http.policy`
pub fn webapp_protocol(properties: &BTreeMap<String, String>) -> (&'static str, u16) {
    match properties.get(HTTP_POLICY) {
        Some(policy) if policy.eq_ignore_ascii_case("https_only") => ("https", 8090),
        _ => ("http", 8088),
    }
}

/// Web address of the resource manager. The port of the configured address
/// is dropped in favour of the default webapp port of the http policy,
/// since `yarn.resourcemanager.address` carries the IPC port.
pub fn resource_manager_uri(properties: &BTreeMap<String, String>) -> Result<Uri, MetricsError> {
    if properties
        .get(RM_HA_ENABLED)
        .is_some_and(|enabled| enabled.eq_ignore_ascii_case("true"))
    {
        return Err(MetricsError::HighAvailability);
    }

    let address = properties
        .get(RM_WEBAPP_ADDRESS)
        .or_else(|| properties.get(RM_ADDRESS))
        .ok_or(MetricsError::MissingAddress)?;
    let host = address.split(':').next().unwrap_or_default();

    if host.is_empty() {
        return Err(MetricsError::MissingAddress);
    }

    let (scheme, port) = webapp_protocol(properties);

    Ok(format!("{scheme}://{host}:{port}").parse()?)
}

/// Ask YARN to kill an application, waiting at most `timeout` for the CLI
pub fn kill_application(cli: &Path, application_id: &str, timeout: Duration) -> bool {
    match Command::new(cli)
        .args(["application", "-kill", application_id])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
    {
        Ok(mut child) => match child.wait_timeout(timeout) {
            Ok(Some(status)) => {
                info!("YARN killed with return code: {status}");

                status.success()
            }
            Ok(None) => {
                warn!(application_id = application_id, "yarn application -kill timed out");
                // best effort, the local process group is killed afterwards anyway
                let _ = child.kill();
                let _ = child.wait();

                false
            }
            Err(e) => {
                warn!(error = ?e, "Failed to wait for yarn application -kill");

                false
            }
        },
        Err(e) => {
            warn!(error = ?e, "Failed to run yarn application -kill");

            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{io::Write, thread};
    use tiny_http::{Header, Response, Server};

    const YARN_SITE_XML: &str = r#"<?xml version="1.0"?>
<configuration>
  <!-- <property><name>yarn.resourcemanager.address</name><value>commented:1</value></property> -->
  <property>
    <name>yarn.resourcemanager.address</name>
    <value>master:8032</value>
  </property>
  <property>
    <name>yarn.nodemanager.aux-services</name>
    <value>spark_shuffle&amp;mapreduce_shuffle</value>
  </property>
</configuration>
"#;

    fn json_header() -> Header {
        Header::from_bytes(&b"Content-Type"[..], &b"application/json"[..]).unwrap()
    }

    // serves canned resource manager answers until the test process exits
    fn serve() -> Uri {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();

        thread::spawn(move || {
            for request in server.incoming_requests() {
                let accepts_json = request
                    .headers()
                    .iter()
                    .any(|header| header.field.equiv("Accept") && header.value.as_str() == JSON);
                let url = request.url().to_string();

                let response = if !accepts_json {
                    Response::from_data("wants json").with_status_code(406)
                } else if url == ROUTE_INFO {
                    Response::from_data(r#"{"clusterInfo":{"state":"STARTED"}}"#)
                        .with_header(json_header())
                } else if url == format!("{ROUTE_APPS}application_1_0001") {
                    Response::from_data(
                        r#"{"app":{"id":"application_1_0001","memorySeconds":151730,"vcoreSeconds":103,"elapsedTime":32731}}"#,
                    )
                    .with_header(json_header())
                } else if url == format!("{ROUTE_APPS}application_xml") {
                    Response::from_data("<app/>").with_header(
                        Header::from_bytes(&b"Content-Type"[..], &b"application/xml"[..]).unwrap(),
                    )
                } else {
                    Response::from_data("{}").with_status_code(404)
                };

                let _ = request.respond(response);
            }
        });

        format!("http://127.0.0.1:{port}").parse().unwrap()
    }

    #[test]
    fn reads_properties() {
        let properties = read_properties(YARN_SITE_XML);

        assert_eq!(properties.len(), 2);
        assert_eq!(properties[RM_ADDRESS], "master:8032");
        assert_eq!(
            properties["yarn.nodemanager.aux-services"],
            "spark_shuffle&mapreduce_shuffle"
        );
    }

    #[test]
    fn reads_attributes_and_cdata() {
        let xml = r#"<configuration>
  <property final="true">
    <name>yarn.resourcemanager.webapp.address</name>
    <value><![CDATA[rm.example:8088]]></value>
    <source>yarn-site.xml</source>
  </property>
  <property><name>yarn.acl</name><value><![CDATA[a&b <c>]]></value></property>
  <property/>
  <property final="true" />
  <properties><name>not.a.property</name><value>x</value></properties>
</configuration>"#;
        let properties = read_properties(xml);

        assert_eq!(properties.len(), 2);
        assert_eq!(properties[RM_WEBAPP_ADDRESS], "rm.example:8088");
        assert_eq!(properties["yarn.acl"], "a&b <c>");
    }

    #[test]
    fn protocol_follows_policy() {
        let mut properties = BTreeMap::new();
        assert_eq!(webapp_protocol(&properties), ("http", 8088));

        properties.insert(HTTP_POLICY.to_string(), "HTTPS_ONLY".to_string());
        assert_eq!(webapp_protocol(&properties), ("https", 8090));

        properties.insert(HTTP_POLICY.to_string(), "HTTP_AND_HTTPS".to_string());
        assert_eq!(webapp_protocol(&properties), ("http", 8088));
    }

    #[test]
    fn resource_manager_address() {
        let mut properties = read_properties(YARN_SITE_XML);
        assert_eq!(
            resource_manager_uri(&properties).unwrap().to_string(),
            "http://master:8088/"
        );

        properties.insert(RM_WEBAPP_ADDRESS.to_string(), "webapp.host:8088".to_string());
        properties.insert(HTTP_POLICY.to_string(), "HTTPS_ONLY".to_string());
        assert_eq!(
            resource_manager_uri(&properties).unwrap().to_string(),
            "https://webapp.host:8090/"
        );

        properties.insert(RM_HA_ENABLED.to_string(), "True".to_string());
        assert!(matches!(
            resource_manager_uri(&properties),
            Err(MetricsError::HighAvailability)
        ));

        assert!(matches!(
            resource_manager_uri(&BTreeMap::new()),
            Err(MetricsError::MissingAddress)
        ));
    }

    #[test]
    fn finds_yarn_site_in_conf_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(find_yarn_site(Some(dir.path())), None);

        let mut file = fs::File::create(dir.path().join(YARN_SITE)).unwrap();
        file.write_all(YARN_SITE_XML.as_bytes()).unwrap();

        assert_eq!(
            find_yarn_site(Some(dir.path())),
            Some(dir.path().join(YARN_SITE))
        );
    }

    #[test]
    fn queries_application_metrics() {
        let metrics = YarnMetrics::connect(serve(), Duration::from_secs(5)).unwrap();

        assert_eq!(
            metrics.cluster_info().unwrap()["clusterInfo"]["state"],
            "STARTED"
        );

        let perf = metrics.get_perf_metrics("application_1_0001").unwrap();
        assert_eq!(perf.memory_seconds, 151730.0);
        assert_eq!(perf.vcore_seconds, 103.0);
        assert_eq!(perf.elapsed, Duration::from_millis(32731));
    }

    #[test]
    fn rejects_bad_answers() {
        let metrics = YarnMetrics::new(serve(), Duration::from_secs(5)).unwrap();

        assert!(matches!(
            metrics.get_perf_metrics("application_xml"),
            Err(MetricsError::ContentType(content_type)) if content_type == "application/xml"
        ));
        assert!(matches!(
            metrics.get_perf_metrics("application_missing"),
            Err(MetricsError::Request(_))
        ));
    }

    #[test]
    fn kill_reports_cli_outcome() {
        let metrics = YarnMetrics::new(serve(), Duration::from_secs(5)).unwrap();
        assert_eq!(metrics.cli(), Path::new(YARN_CLI));

        assert!(metrics
            .clone()
            .with_cli("/bin/true")
            .kill_application("application_1_0001", Duration::from_secs(5)));
        assert!(!metrics
            .clone()
            .with_cli("/bin/false")
            .kill_application("application_1_0001", Duration::from_secs(5)));
        assert!(!metrics
            .with_cli("/nonexistent/yarn")
            .kill_application("application_1_0001", Duration::from_secs(5)));
    }

    #[test]
    fn unreachable_resource_manager() {
        // nothing listens on the discard port
        let result = YarnMetrics::connect("http://127.0.0.1:9".parse().unwrap(), Duration::from_secs(2));

        assert!(matches!(result, Err(MetricsError::Unreachable(_))));
    }

    #[test]
    fn load_uses_configured_resource_manager() {
        let config = YarnConfig {
            resource_manager: Some(serve()),
            request_timeout_secs: 5,
            cli: PathBuf::from("/opt/hadoop/bin/yarn"),
            ..Default::default()
        };

        let metrics = YarnMetrics::load(&config).unwrap();
        assert_eq!(metrics.cli(), Path::new("/opt/hadoop/bin/yarn"));
    }
}
