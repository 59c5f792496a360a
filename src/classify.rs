use once_cell::sync::Lazy;
use regex::Regex;

use crate::request::RequestMeta;

/// Device class derived from the user agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceClass {
    Pc,
    Mobile,
}

impl DeviceClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Pc => "pc",
            DeviceClass::Mobile => "mobile",
        }
    }
}

/// Request category used purely for routing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Purge,
    Sitemap,
    Asset,
    Api,
    View,
}

/// Result of classifying one request. Classification is total: every field
/// is computed for every request, callers decide what to act on.
#[derive(Debug, Clone, Copy)]
pub struct Classification {
    pub device: DeviceClass,
    pub category: Category,
    pub authenticated: bool,
    pub suspicious: bool,
}

/// Mobile platform markers, matched case-insensitively against the UA.
static MOBILE_UA_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"(?i)android").unwrap(),
        Regex::new(r"(?i)iphone|ipod").unwrap(),
        Regex::new(r"(?i)windows phone|iemobile").unwrap(),
        Regex::new(r"(?i)blackberry|bb10").unwrap(),
        Regex::new(r"(?i)opera mini|opera mobi").unwrap(),
        Regex::new(r"(?i)symbian|series60|nokia").unwrap(),
        Regex::new(r"(?i)webos|palm").unwrap(),
        Regex::new(r"(?i)\bmobile\b.*safari").unwrap(),
    ]
});

/// Smart TVs embed "Mobile" in their UA but render the desktop site.
/// This exception always overrides a mobile match.
static SMART_TV_EXCEPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)smart-?tv|hbbtv|googletv|appletv|crkey").unwrap());

/// WAP content signals in the Accept header.
static WAP_ACCEPT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"text/vnd\.wap\.wml|application/vnd\.wap\.xhtml\+xml").unwrap());

/// Session/token cookie names. Case-sensitive on purpose: these are the
/// exact cookie names the application issues.
static SESSION_COOKIE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"([sS]ession|Token)=").unwrap());

/// Modern browser signatures with per-family minimum version floors.
/// Anything not on this list is treated as suspicious.
static MODERN_BROWSERS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        // Edge carries a Chrome token too, so it is checked first.
        Regex::new(r"Edg(e|A|iOS)?/(8\d|9\d|\d{3})\.").unwrap(),
        Regex::new(r"Chrom(e|ium)/(8\d|9\d|\d{3})\.").unwrap(),
        Regex::new(r"Firefox/(7[8-9]|8\d|9\d|\d{3})\.").unwrap(),
        Regex::new(r"Version/(1[4-9]|[2-9]\d)[.\d]* (Mobile/\w+ )?Safari/").unwrap(),
        Regex::new(r"OPR/(7\d|8\d|9\d|\d{3})\.").unwrap(),
    ]
});

/// Operating systems with no supported browser builds. A UA claiming a
/// modern browser on one of these is lying.
static LEGACY_OS: Lazy<Vec<Regex>> = Lazy::new(|| {
    vec![
        Regex::new(r"Windows (98|ME|CE|NT [45]\.)").unwrap(),
        Regex::new(r"PPC Mac OS X").unwrap(),
        Regex::new(r"Mac OS X 10[._][0-9]\b").unwrap(),
    ]
});

/// Path prefixes for static-asset-like content.
const ASSET_PREFIXES: &[&str] = &["/images/", "/static/"];

/// Path prefixes for API and REST/content-service traffic.
const API_PREFIXES: &[&str] = &["/api/", "/w/api.php", "/w/rest.php"];

/// Classify a request. Pure function over header strings; no side effects.
pub fn classify(req: &RequestMeta) -> Classification {
    Classification {
        device: classify_device(req),
        category: classify_category(req),
        authenticated: is_authenticated(req),
        suspicious: is_suspicious(req),
    }
}

fn classify_device(req: &RequestMeta) -> DeviceClass {
    let user_agent = req.user_agent();
    let accept = req.header("accept").unwrap_or("");

    if SMART_TV_EXCEPTION.is_match(user_agent) {
        return DeviceClass::Pc;
    }

    let mobile_ua = MOBILE_UA_PATTERNS.iter().any(|p| p.is_match(user_agent));
    if mobile_ua || WAP_ACCEPT.is_match(accept) {
        DeviceClass::Mobile
    } else {
        DeviceClass::Pc
    }
}

fn classify_category(req: &RequestMeta) -> Category {
    if req.method == "PURGE" {
        return Category::Purge;
    }
    if req.path.ends_with(".xml") || req.path.ends_with(".xml.gz") {
        return Category::Sitemap;
    }
    if ASSET_PREFIXES.iter().any(|p| req.path.starts_with(p)) {
        return Category::Asset;
    }
    if API_PREFIXES.iter().any(|p| req.path.starts_with(p)) {
        return Category::Api;
    }
    Category::View
}

fn is_authenticated(req: &RequestMeta) -> bool {
    if req.headers.contains_key("authorization") {
        return true;
    }
    match req.header("cookie") {
        Some(cookie) => SESSION_COOKIE.is_match(cookie),
        None => false,
    }
}

fn is_suspicious(req: &RequestMeta) -> bool {
    let user_agent = req.user_agent();

    let modern = MODERN_BROWSERS.iter().any(|p| p.is_match(user_agent));
    if !modern {
        return true;
    }
    LEGACY_OS.iter().any(|p| p.is_match(user_agent))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::test_support::RequestBuilder;

    const CHROME_UA: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
    const ANDROID_UA: &str = "Mozilla/5.0 (Linux; Android 13; Pixel 7) \
        AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Mobile Safari/537.36";

    #[test]
    fn desktop_chrome_is_pc_and_not_suspicious() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", CHROME_UA)
            .build();
        let c = classify(&req);
        assert_eq!(c.device, DeviceClass::Pc);
        assert_eq!(c.category, Category::View);
        assert!(!c.authenticated);
        assert!(!c.suspicious);
    }

    #[test]
    fn android_ua_is_mobile() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", ANDROID_UA)
            .build();
        assert_eq!(classify(&req).device, DeviceClass::Mobile);
    }

    #[test]
    fn smart_tv_exception_overrides_mobile_match() {
        let ua = "Mozilla/5.0 (SMART-TV; Linux; Tizen 6.0) \
            AppleWebKit/537.36 Chrome/120.0.0.0 Mobile Safari/537.36";
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", ua)
            .build();
        assert_eq!(classify(&req).device, DeviceClass::Pc);
    }

    #[test]
    fn wap_accept_signals_mobile() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", "SomeFeaturePhone/1.0")
            .header("accept", "text/vnd.wap.wml")
            .build();
        assert_eq!(classify(&req).device, DeviceClass::Mobile);
    }

    #[test]
    fn category_precedence() {
        assert_eq!(
            classify(&RequestBuilder::with_method("PURGE", "/sitemap.xml").build()).category,
            Category::Purge
        );
        assert_eq!(
            classify(&RequestBuilder::get("/sitemap.xml.gz").build()).category,
            Category::Sitemap
        );
        assert_eq!(
            classify(&RequestBuilder::get("/images/logo.png").build()).category,
            Category::Asset
        );
        assert_eq!(
            classify(&RequestBuilder::get("/w/api.php?action=query").build()).category,
            Category::Api
        );
        assert_eq!(
            classify(&RequestBuilder::get("/api/rest_v1/page/html/Foo").build()).category,
            Category::Api
        );
        assert_eq!(
            classify(&RequestBuilder::get("/wiki/Main_Page").build()).category,
            Category::View
        );
    }

    #[test]
    fn session_cookie_marks_authenticated() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("cookie", "session=abc123")
            .build();
        assert!(classify(&req).authenticated);

        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("cookie", "centralauth_Token=deadbeef")
            .build();
        assert!(classify(&req).authenticated);
    }

    #[test]
    fn cookie_name_match_is_case_sensitive() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("cookie", "SESSION=abc123; prefs=dark")
            .build();
        assert!(!classify(&req).authenticated);
    }

    #[test]
    fn authorization_header_marks_authenticated() {
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("authorization", "Bearer xyz")
            .build();
        assert!(classify(&req).authenticated);
    }

    #[test]
    fn missing_ua_is_suspicious() {
        let req = RequestBuilder::get("/wiki/Main_Page").build();
        assert!(classify(&req).suspicious);
    }

    #[test]
    fn old_browser_version_is_suspicious() {
        let ua = "Mozilla/5.0 (Windows NT 10.0) AppleWebKit/537.36 \
            Chrome/49.0.2623.112 Safari/537.36";
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", ua)
            .build();
        assert!(classify(&req).suspicious);
    }

    #[test]
    fn modern_browser_on_legacy_os_is_suspicious() {
        let ua = "Mozilla/5.0 (Windows NT 5.1) AppleWebKit/537.36 \
            Chrome/120.0.0.0 Safari/537.36";
        let req = RequestBuilder::get("/wiki/Main_Page")
            .header("user-agent", ua)
            .build();
        assert!(classify(&req).suspicious);
    }

    #[test]
    fn suspicion_is_computed_for_asset_requests_too() {
        let req = RequestBuilder::get("/images/logo.png").build();
        let c = classify(&req);
        assert_eq!(c.category, Category::Asset);
        assert!(c.suspicious);
    }
}
