use crate::types::Headers;
use bytes::Bytes;

#[derive(Debug, Clone)]
pub struct Response {
    pub request_id: usize,
    pub headers: Headers,
    pub body: Bytes,
}

impl Response {
    pub fn header(&self, key: impl AsRef<str>) -> Option<&str> {
        let key = key.as_ref();
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_ref())
    }

    pub fn status(&self) -> u16 {
        self.header(":status")
            .expect("no status in response")
            .parse()
            .expect("non-number status")
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    #[cfg(feature = "json")]
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::types::Error> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response() -> Response {
        Response {
            request_id: 1,
            headers: vec![
                (":status".to_owned(), "200".to_owned()),
                ("content-type".to_owned(), "application/json".to_owned()),
            ],
            body: Bytes::from_static(br#"{"name":"morpheus"}"#),
        }
    }

    #[test]
    fn header_lookup_ignores_case() {
        let response = response();
        assert_eq!(response.status(), 200);
        assert_eq!(response.header("Content-Type"), Some("application/json"));
        assert_eq!(response.header("location"), None);
    }

    #[cfg(feature = "json")]
    #[test]
    fn json_body_deserializes() {
        #[derive(serde::Deserialize)]
        struct Named {
            name: String,
        }
        let named: Named = response().json().unwrap();
        assert_eq!(named.name, "morpheus");
    }
}
