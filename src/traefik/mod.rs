use minijinja::Environment;

const CANARY_TEMPLATE: &str = include_str!("../../templates/canary-routing.yml.j2");
const REMOTE_ROUTE_TEMPLATE: &str = include_str!("../../templates/remote-route.yml.j2");

/// Directory watched by Traefik's file provider.
pub const DYNAMIC_DIR: &str = "/etc/traefik/dynamic";

/// Public hostname of an application and whether it is served over TLS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    pub host: String,
    pub tls: bool,
}

impl Route {
    /// Parse an fqdn setting such as `https://app.example.com,https://www.example.com`.
    /// Only the first entry is routed; the scheme decides TLS.
    pub fn from_fqdn(fqdn: &str) -> Option<Self> {
        let first = fqdn.split(',').next()?.trim();
        let tls = first.starts_with("https://");
        let host = normalize_host(first);
        if host.is_empty() {
            return None;
        }
        Some(Self { host, tls })
    }

    pub fn entrypoint(&self) -> &'static str {
        if self.tls {
            "websecure"
        } else {
            "web"
        }
    }
}

/// Strip the scheme, any path, and keep the first of several comma-separated hosts.
pub fn normalize_host(fqdn: &str) -> String {
    let first = fqdn.split(',').next().unwrap_or("").trim();
    let without_scheme = first
        .strip_prefix("https://")
        .or_else(|| first.strip_prefix("http://"))
        .unwrap_or(first);
    without_scheme
        .split('/')
        .next()
        .unwrap_or("")
        .to_string()
}

pub fn dynamic_config_path(name: &str) -> String {
    format!("{}/{}.yml", DYNAMIC_DIR, name)
}

pub struct WeightedRouting<'a> {
    pub name: &'a str,
    pub route: &'a Route,
    pub port: u16,
    pub canary_weight: u32,
    pub stable_weight: u32,
    pub canary_container: &'a str,
    pub stable_container: &'a str,
}

/// Dynamic config splitting traffic for one host between two containers.
pub fn render_weighted_routing(routing: &WeightedRouting<'_>) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("canary", CANARY_TEMPLATE)?;
    env.get_template("canary")?.render(minijinja::context! {
        name => routing.name,
        host => &routing.route.host,
        tls => routing.route.tls,
        entrypoint => routing.route.entrypoint(),
        port => routing.port,
        canary_weight => routing.canary_weight,
        stable_weight => routing.stable_weight,
        canary_container => routing.canary_container,
        stable_container => routing.stable_container,
    })
}

/// Dynamic config for the primary proxy forwarding a host to another server's proxy.
pub fn render_remote_route(name: &str, route: &Route, address: &str) -> Result<String, minijinja::Error> {
    let mut env = Environment::new();
    env.add_template("remote", REMOTE_ROUTE_TEMPLATE)?;
    env.get_template("remote")?.render(minijinja::context! {
        name => name,
        host => &route.host,
        tls => route.tls,
        entrypoint => route.entrypoint(),
        address => address,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalizes_hosts() {
        assert_eq!(
            normalize_host("https://app.example.com,https://www.example.com"),
            "app.example.com"
        );
        assert_eq!(normalize_host("http://app.example.com/api"), "app.example.com");
        assert_eq!(normalize_host("app.example.com"), "app.example.com");
    }

    #[test]
    fn route_from_fqdn() {
        let route = Route::from_fqdn("https://shop.example.com").unwrap();
        assert!(route.tls);
        assert_eq!(route.entrypoint(), "websecure");
        assert_eq!(Route::from_fqdn("http://a.test").unwrap().entrypoint(), "web");
        assert_eq!(Route::from_fqdn(""), None);
    }

    #[test]
    fn remote_route_points_at_server() {
        let route = Route::from_fqdn("http://shop.example.com").unwrap();
        let yaml = render_remote_route("shop-edge-2", &route, "10.0.0.7").unwrap();
        let doc: serde_yaml::Value = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(
            doc["http"]["routers"]["shop-edge-2"]["rule"],
            serde_yaml::Value::from("Host(`shop.example.com`)")
        );
        assert_eq!(
            doc["http"]["services"]["shop-edge-2"]["loadBalancer"]["servers"][0]["url"],
            serde_yaml::Value::from("http://10.0.0.7")
        );
        assert!(doc["http"]["routers"]["shop-edge-2"].get("tls").is_none());
    }
}
