//! The offline document served when a navigation cannot reach the network.
//!
//! The router only ever serves finished bytes (see
//! [`CacheConfig::offline_page`](crate::CacheConfig::offline_page)). Rendering
//! the locale placeholders happens before that, through a [`MessageCatalog`].

use hashbrown::HashMap;
use url::Url;

use cardcache_net::Response;

/// Built-in offline page. Self-contained: inline styles, no scripts beyond the
/// reload button.
pub const DEFAULT_OFFLINE_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>{{ T "OfflineTitle" .Lang }}</title>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1">
    <style>
        body {
            font-family: Arial, sans-serif;
            text-align: center;
            padding: 20px;
            background-color: #f0f0f0;
        }
        .offline-container {
            max-width: 500px;
            margin: 50px auto;
            padding: 30px;
            background: white;
            border-radius: 10px;
            box-shadow: 0 2px 10px rgba(0,0,0,0.1);
        }
    </style>
</head>
<body>
    <div class="offline-container">
        <h1>{{ T "OfflineHeader" .Lang }}</h1>
        <p>{{ T "OfflineMessage" .Lang }}</p>
        <button onclick="location.reload()">{{ T "RetryButton" .Lang }}</button>
    </div>
</body>
</html>
"#;

/// Source of localized strings for template placeholders.
pub trait MessageCatalog {
    /// Look up `key` for `lang`.
    fn message(&self, key: &str, lang: &str) -> Option<String>;
}

/// Language used when a message is missing for the requested one.
pub const DEFAULT_LANG: &str = "en";

/// In-memory catalog: `lang -> key -> message`.
///
/// Lookups for a language without the key fall back to the default language.
#[derive(Debug, Clone)]
pub struct StaticCatalog {
    messages: HashMap<String, HashMap<String, String>>,
    default_lang: String,
}

impl Default for StaticCatalog {
    fn default() -> Self {
        Self {
            messages: HashMap::new(),
            default_lang: DEFAULT_LANG.to_string(),
        }
    }
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_lang(mut self, lang: &str) -> Self {
        self.default_lang = lang.to_string();
        self
    }

    /// Catalog with the offline page strings in English and Russian.
    pub fn builtin() -> Self {
        Self::new()
            .with("en", "OfflineTitle", "Offline")
            .with("en", "OfflineHeader", "You are offline")
            .with(
                "en",
                "OfflineMessage",
                "Check your internet connection and try again.",
            )
            .with("en", "RetryButton", "Retry")
            .with("ru", "OfflineTitle", "Нет соединения")
            .with("ru", "OfflineHeader", "Вы не в сети")
            .with(
                "ru",
                "OfflineMessage",
                "Проверьте подключение к интернету и попробуйте снова.",
            )
            .with("ru", "RetryButton", "Повторить")
    }

    /// Add a message.
    pub fn with(mut self, lang: &str, key: &str, message: &str) -> Self {
        self.insert(lang, key, message);
        self
    }

    pub fn insert(&mut self, lang: &str, key: &str, message: &str) {
        self.messages
            .entry(lang.to_string())
            .or_default()
            .insert(key.to_string(), message.to_string());
    }
}

impl MessageCatalog for StaticCatalog {
    fn message(&self, key: &str, lang: &str) -> Option<String> {
        [lang, self.default_lang.as_str()]
            .into_iter()
            .find_map(|lang| self.messages.get(lang)?.get(key))
            .cloned()
    }
}

/// A page with `{{ T "Key" .Lang }}` placeholders.
#[derive(Debug, Clone)]
pub struct OfflineTemplate {
    source: String,
}

impl Default for OfflineTemplate {
    fn default() -> Self {
        Self::new(DEFAULT_OFFLINE_TEMPLATE)
    }
}

impl OfflineTemplate {
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
        }
    }

    /// Message keys referenced by the template, in order of appearance.
    pub fn placeholders(&self) -> Vec<&str> {
        Tokens::new(&self.source)
            .filter_map(|token| match token {
                Token::Message(key) => Some(key),
                Token::Text(_) => None,
            })
            .collect()
    }

    /// Render every placeholder for `lang`.
    ///
    /// Messages are HTML-escaped. Missing messages render as `<<Key>>`.
    /// Anything between `{{` and `}}` that is not a message lookup is left
    /// untouched.
    pub fn render(&self, catalog: &dyn MessageCatalog, lang: &str) -> String {
        let mut out = String::with_capacity(self.source.len());
        for token in Tokens::new(&self.source) {
            match token {
                Token::Text(text) => out.push_str(text),
                Token::Message(key) => match catalog.message(key, lang) {
                    Some(message) => push_escaped(&mut out, &message),
                    None => {
                        out.push_str("<<");
                        out.push_str(key);
                        out.push_str(">>");
                    }
                },
            }
        }
        out
    }
}

/// Build the response for a failed navigation to `url`.
pub fn offline_response(url: Url, html: &str) -> Response {
    Response::html(url, html.to_string())
}

fn push_escaped(out: &mut String, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
}

enum Token<'a> {
    Text(&'a str),
    Message(&'a str),
}

struct Tokens<'a> {
    rest: &'a str,
}

impl<'a> Tokens<'a> {
    fn new(source: &'a str) -> Self {
        Self { rest: source }
    }
}

impl<'a> Iterator for Tokens<'a> {
    type Item = Token<'a>;

    fn next(&mut self) -> Option<Token<'a>> {
        if self.rest.is_empty() {
            return None;
        }

        let Some(start) = self.rest.find("{{") else {
            let text = self.rest;
            self.rest = "";
            return Some(Token::Text(text));
        };
        if start > 0 {
            let text = &self.rest[..start];
            self.rest = &self.rest[start..];
            return Some(Token::Text(text));
        }

        let Some(end) = self.rest.find("}}") else {
            let text = self.rest;
            self.rest = "";
            return Some(Token::Text(text));
        };
        let raw = &self.rest[..end + 2];
        self.rest = &self.rest[end + 2..];

        match parse_message_key(&raw[2..raw.len() - 2]) {
            Some(key) => Some(Token::Message(key)),
            None => Some(Token::Text(raw)),
        }
    }
}

/// `T "Key" .Lang` -> `Key`
fn parse_message_key(inner: &str) -> Option<&str> {
    let rest = inner.trim().strip_prefix('T')?.trim_start();
    let rest = rest.strip_prefix('"')?;
    let (key, rest) = rest.split_once('"')?;
    if rest.trim() != ".Lang" || key.is_empty() {
        return None;
    }
    Some(key)
}
