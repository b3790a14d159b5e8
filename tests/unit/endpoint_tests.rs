//! Unit tests for endpoint name validation.

use dictlink::models::endpoint::MAX_ENDPOINT_BYTES;
use dictlink::models::EndpointName;
use dictlink::AppError;

fn bind_error(name: &str) -> String {
    match EndpointName::new(name) {
        Err(AppError::Bind(msg)) => msg,
        other => panic!("expected bind error for {name:?}, got {other:?}"),
    }
}

#[test]
fn accepts_reverse_dns_style_name() {
    let name = EndpointName::new("com.example.myservice").expect("valid name");
    assert_eq!(name.as_str(), "com.example.myservice");
    assert_eq!(name.to_string(), "com.example.myservice");
}

#[test]
fn parses_from_str() {
    let name: EndpointName = "svc".parse().expect("valid name");
    assert_eq!(name, EndpointName::new("svc").expect("valid name"));
}

#[test]
fn rejects_empty_name() {
    assert_eq!(bind_error(""), "endpoint name must not be empty");
}

#[test]
fn length_limit_is_inclusive() {
    let at_limit = "a".repeat(MAX_ENDPOINT_BYTES);
    assert!(EndpointName::new(at_limit).is_ok());

    let over = "a".repeat(MAX_ENDPOINT_BYTES + 1);
    assert!(bind_error(&over).contains("exceeds 96 bytes"));
}

#[test]
fn rejects_path_separator_and_nul() {
    assert!(bind_error("a/b").contains("forbidden character"));
    assert!(bind_error("a\0b").contains("forbidden character"));
}

#[test]
fn resolves_to_socket_name() {
    let name = EndpointName::new("dictlink.resolve-test").expect("valid name");
    assert!(name.to_socket_name().is_ok());
}
