use super::{
    handlers::{health, policies, system, users},
    mode::Mode,
};
use crate::{
    rbac::Policy,
    store::UserView,
    system::{SetupParams, SystemStatus},
};
use utoipa::{
    OpenApi,
    openapi::{Contact, InfoBuilder, License, Tag},
};

#[derive(OpenApi)]
#[openapi(
    paths(
        health::health,
        system::status,
        system::setup,
        users::login,
        users::register,
        users::logout,
        users::me,
        policies::list,
        policies::add,
        policies::remove,
    ),
    components(schemas(
        health::Health,
        SetupParams,
        SystemStatus,
        users::LoginRequest,
        users::LoginResponse,
        users::RegisterRequest,
        UserView,
        Policy,
        policies::PolicyRequest,
        Mode,
    ))
)]
struct ApiDoc;

/// The `OpenAPI` document for the application routes, with Cargo metadata.
#[must_use]
pub fn openapi() -> utoipa::openapi::OpenApi {
    let mut spec = ApiDoc::openapi();
    spec.info = cargo_info();
    spec.tags = Some(vec![
        tag("health", "Liveness and storage reachability"),
        tag("system", "Installation status and first-run setup"),
        tag("users", "Login, logout and self-registration"),
        tag("rbac", "Runtime policy administration"),
    ]);
    spec
}

fn tag(name: &str, description: &str) -> Tag {
    let mut tag = Tag::new(name);
    tag.description = Some(description.to_string());
    tag
}

fn cargo_info() -> utoipa::openapi::Info {
    let mut info = InfoBuilder::new()
        .title(env!("CARGO_PKG_NAME"))
        .version(env!("CARGO_PKG_VERSION"))
        .description(optional_str(env!("CARGO_PKG_DESCRIPTION")))
        .build();

    info.contact = cargo_contact();
    info.license = cargo_license();
    info
}

fn cargo_contact() -> Option<Contact> {
    // Cargo authors are `;` separated and may include "Name <email>".
    let authors = env!("CARGO_PKG_AUTHORS");
    let primary = authors.split(';').next().map(str::trim)?;
    if primary.is_empty() {
        return None;
    }

    let (name, email) = parse_author(primary);
    if name.is_none() && email.is_none() {
        return None;
    }

    let mut contact = Contact::new();
    contact.name = name.map(str::to_string);
    contact.email = email.map(str::to_string);
    Some(contact)
}

fn cargo_license() -> Option<License> {
    let identifier = optional_str(env!("CARGO_PKG_LICENSE"))?;
    let mut license = License::new(identifier);
    license.identifier = Some(identifier.to_string());
    Some(license)
}

fn optional_str(value: &'static str) -> Option<&'static str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn parse_author(author: &str) -> (Option<&str>, Option<&str>) {
    fn non_empty(value: &str) -> Option<&str> {
        (!value.is_empty()).then_some(value)
    }

    match author.split_once('<') {
        Some((name, email)) => (
            non_empty(name.trim()),
            non_empty(email.trim_end_matches('>').trim()),
        ),
        None => (non_empty(author.trim()), None),
    }
}
