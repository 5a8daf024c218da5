// Passive security checks for audited pages

use crate::collaborators::Checker;
use crate::model::{Element, ElementKind, Issue, IssueKind, PageData, Severity};
use async_trait::async_trait;
use url::Url;

fn is_success(page: &PageData) -> bool {
    (200..300).contains(&page.status_code)
}

pub fn check_security_headers(page: &PageData) -> Vec<Issue> {
    let mut issues = Vec::new();

    let is_html = page
        .header("content-type")
        .is_some_and(|content_type| content_type.contains("text/html"));
    if !is_success(page) || !is_html {
        return issues;
    }

    if page.header("x-frame-options").is_none()
        && !page
            .header("content-security-policy")
            .is_some_and(|csp| csp.contains("frame-ancestors"))
    {
        issues.push(Issue {
            kind: IssueKind::SecurityHeaderMissing,
            severity: Severity::Low,
            title: "Missing X-Frame-Options Header".to_string(),
            description: "The X-Frame-Options header is not set, which may allow clickjacking attacks.".to_string(),
            url: page.url.clone(),
            element: None,
            remediation: Some("Add 'X-Frame-Options: DENY' or 'X-Frame-Options: SAMEORIGIN' header to HTTP responses.".to_string()),
            evidence: None,
            cwe_id: Some("CWE-1021".to_string()),
        });
    }

    if page.url.starts_with("https://") && page.header("strict-transport-security").is_none() {
        issues.push(Issue {
            kind: IssueKind::SecurityHeaderMissing,
            severity: Severity::Low,
            title: "Missing Strict-Transport-Security Header".to_string(),
            description: "The HSTS header is not set, so browsers may still reach this site over plain HTTP.".to_string(),
            url: page.url.clone(),
            element: None,
            remediation: Some("Add 'Strict-Transport-Security: max-age=31536000; includeSubDomains'.".to_string()),
            evidence: None,
            cwe_id: Some("CWE-319".to_string()),
        });
    }

    issues
}

pub fn check_insecure_transport(page: &PageData) -> Vec<Issue> {
    let mut issues = Vec::new();

    if let Ok(parsed_url) = Url::parse(&page.url)
        && parsed_url.scheme() == "http"
        && let Some(host) = parsed_url.host_str()
        && !host.starts_with("127.")
        && host != "localhost"
    {
        issues.push(Issue {
            kind: IssueKind::InsecureTransport,
            severity: Severity::Medium,
            title: "Insecure Transport (HTTP)".to_string(),
            description: format!("The endpoint {} is served over HTTP instead of HTTPS.", page.url),
            url: page.url.clone(),
            element: None,
            remediation: Some("Enable HTTPS for this endpoint and redirect all HTTP traffic to HTTPS.".to_string()),
            evidence: Some(format!("{{\"url\": \"{}\", \"scheme\": \"http\"}}", page.url)),
            cwe_id: Some("CWE-319".to_string()),
        });
    }

    issues
}

pub fn check_interesting_files(page: &PageData) -> Vec<Issue> {
    let mut issues = Vec::new();
    if !is_success(page) {
        return issues;
    }

    let Ok(parsed_url) = Url::parse(&page.url) else {
        return issues;
    };
    let path = parsed_url.path().to_lowercase();

    let interesting_patterns = [
        (".git/", "Git Repository Exposed", Severity::High, "CWE-538"),
        (".env", "Environment File Exposed", Severity::Critical, "CWE-200"),
        ("/.aws/", "AWS Credentials Directory", Severity::Critical, "CWE-200"),
        ("/backup", "Backup File Accessible", Severity::Medium, "CWE-530"),
        (".sql", "SQL Dump File", Severity::High, "CWE-530"),
        (".bak", "Backup File", Severity::Medium, "CWE-530"),
        ("web.config", "Configuration File Exposed", Severity::High, "CWE-215"),
        ("phpinfo.php", "PHP Info Page", Severity::Info, "CWE-200"),
        ("/admin", "Admin Interface", Severity::Info, "CWE-200"),
    ];

    // One report per URL
    if let Some((_, title, severity, cwe)) = interesting_patterns
        .iter()
        .find(|(pattern, ..)| path.contains(pattern))
    {
        issues.push(Issue {
            kind: IssueKind::InterestingFile,
            severity: *severity,
            title: title.to_string(),
            description: format!("Discovered potentially sensitive file or directory: {}", page.url),
            url: page.url.clone(),
            element: None,
            remediation: Some("Review if this resource should be publicly accessible. Consider removing or restricting access.".to_string()),
            evidence: Some(format!("{{\"url\": \"{}\", \"status_code\": {}}}", page.url, page.status_code)),
            cwe_id: Some(cwe.to_string()),
        });
    }

    issues
}

pub fn check_error_messages(page: &PageData) -> Vec<Issue> {
    if !(500..600).contains(&page.status_code) {
        return Vec::new();
    }

    vec![Issue {
        kind: IssueKind::InformationDisclosure,
        severity: Severity::Low,
        title: format!("Server Error - {}", page.status_code),
        description: format!(
            "Server returned error code {} for {}. Error pages may leak sensitive information.",
            page.status_code, page.url
        ),
        url: page.url.clone(),
        element: None,
        remediation: Some("Configure custom error pages that don't reveal system details.".to_string()),
        evidence: Some(format!("{{\"url\": \"{}\", \"status_code\": {}}}", page.url, page.status_code)),
        cwe_id: Some("CWE-209".to_string()),
    }]
}

/// Forms that post credentials to a plain HTTP action.
pub fn check_credential_forms(page: &PageData, elements: &[Element]) -> Vec<Issue> {
    elements
        .iter()
        .filter(|element| element.kind == ElementKind::Form)
        .filter(|element| element.action.starts_with("http://"))
        .filter(|element| {
            element
                .inputs
                .iter()
                .any(|(name, _)| name.to_lowercase().contains("pass"))
        })
        .map(|element| Issue {
            kind: IssueKind::Vulnerability,
            severity: Severity::High,
            title: "Credentials Submitted Over HTTP".to_string(),
            description: format!(
                "The form on {} sends a password field to {} without TLS.",
                page.url, element.action
            ),
            url: page.url.clone(),
            element: Some(element.fingerprint()),
            remediation: Some("Serve the login form and its action over HTTPS only.".to_string()),
            evidence: Some(format!("{{\"action\": \"{}\", \"method\": \"{}\"}}", element.action, element.method)),
            cwe_id: Some("CWE-523".to_string()),
        })
        .collect()
}

/// Input values echoed verbatim in the response body.
pub fn check_reflected_inputs(page: &PageData, elements: &[Element]) -> Vec<Issue> {
    let mut issues = Vec::new();

    for element in elements.iter().filter(|e| e.kind == ElementKind::Link) {
        let reflected: Vec<&str> = element
            .inputs
            .iter()
            .filter(|(_, value)| value.len() >= 4 && page.body.contains(value.as_str()))
            .map(|(name, _)| name.as_str())
            .collect();
        if reflected.is_empty() {
            continue;
        }

        issues.push(Issue {
            kind: IssueKind::InjectionPoint,
            severity: Severity::Info,
            title: "Reflected Parameter".to_string(),
            description: format!(
                "Parameters {} of {} are reflected in the response.",
                reflected.join(", "),
                element.action
            ),
            url: page.url.clone(),
            element: Some(element.fingerprint()),
            remediation: Some("Encode user-supplied values before writing them into responses.".to_string()),
            evidence: None,
            cwe_id: Some("CWE-79".to_string()),
        });
    }

    issues
}

/// Runs every passive check. Page-level checks look at the whole page,
/// element-level checks only at the audited elements.
#[derive(Debug, Default, Clone, Copy)]
pub struct PassiveChecker;

#[async_trait]
impl Checker for PassiveChecker {
    async fn check(&self, page: &PageData, elements: &[Element]) -> anyhow::Result<Vec<Issue>> {
        let mut issues = Vec::new();
        issues.extend(check_insecure_transport(page));
        issues.extend(check_interesting_files(page));
        issues.extend(check_error_messages(page));
        issues.extend(check_security_headers(page));
        issues.extend(check_credential_forms(page, elements));
        issues.extend(check_reflected_inputs(page, elements));
        Ok(issues)
    }
}
