use std::cmp::Ordering;
use std::fmt;


/// A well-known CGI/1.1 variable name.
///
/// The variants cover the meta variables of RFC 3875, the extra variables
/// set by common web servers, and frequently sent HTTP request headers in
/// their CGI spelling (`HTTP_` followed by the upper-cased header name with
/// `-` replaced by `_`). They are re-exported as constants from
/// [`cgi`](crate::cgi), so `Request::var(cgi::REQUEST_METHOD)` works without
/// building a string.
#[allow(missing_docs, non_camel_case_types, clippy::upper_case_acronyms)]
#[derive(Clone, Copy, PartialEq, Eq, Hash, strum::IntoStaticStr, strum::EnumString, strum::EnumIter)]
#[strum(use_phf, serialize_all = "SCREAMING_SNAKE_CASE")]
#[non_exhaustive]
pub enum StaticVarName {
    // RFC 3875, Section 4.1
    AUTH_TYPE,
    CONTENT_LENGTH,
    CONTENT_TYPE,
    GATEWAY_INTERFACE,
    PATH_INFO,
    PATH_TRANSLATED,
    QUERY_STRING,
    REMOTE_ADDR,
    REMOTE_HOST,
    REMOTE_IDENT,
    REMOTE_USER,
    REQUEST_METHOD,
    SCRIPT_NAME,
    SERVER_NAME,
    SERVER_PORT,
    SERVER_PROTOCOL,
    SERVER_SOFTWARE,

    // nginx fastcgi_params and Apache mod_fcgid
    DOCUMENT_ROOT,
    DOCUMENT_URI,
    FCGI_ROLE,
    HTTPS,
    REDIRECT_STATUS,
    REMOTE_PORT,
    REQUEST_SCHEME,
    REQUEST_URI,
    SCRIPT_FILENAME,
    SERVER_ADDR,

    // Request headers
    HTTP_ACCEPT,
    HTTP_ACCEPT_ENCODING,
    HTTP_ACCEPT_LANGUAGE,
    HTTP_AUTHORIZATION,
    HTTP_CACHE_CONTROL,
    HTTP_CONNECTION,
    HTTP_CONTENT_LENGTH,
    HTTP_CONTENT_TYPE,
    HTTP_COOKIE,
    HTTP_HOST,
    HTTP_IF_MODIFIED_SINCE,
    HTTP_IF_NONE_MATCH,
    HTTP_ORIGIN,
    HTTP_RANGE,
    HTTP_REFERER,
    HTTP_USER_AGENT,
    HTTP_X_FORWARDED_FOR,
    HTTP_X_FORWARDED_HOST,
    HTTP_X_FORWARDED_PROTO,
    HTTP_X_REAL_IP,
    HTTP_X_REQUESTED_WITH,
    HTTP_X_REQUEST_ID,
}

impl AsRef<str> for StaticVarName {
    #[inline]
    fn as_ref(&self) -> &str {
        self.into()
    }
}

impl fmt::Debug for StaticVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl fmt::Display for StaticVarName {
    #[inline]
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_ref())
    }
}

impl PartialOrd for StaticVarName {
    #[inline]
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Alphabetical, to agree with the ordering of VarName
impl Ord for StaticVarName {
    #[inline]
    fn cmp(&self, other: &Self) -> Ordering {
        self.as_ref().cmp(other.as_ref())
    }
}
