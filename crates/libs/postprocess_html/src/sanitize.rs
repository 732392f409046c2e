//! Script sanitization, math renderer injection, and final head cleanup.

use kuchikiki::NodeRef;

use crate::dom;

/// Prefixes a `script src` may carry and survive sanitization.
const SAFE_SCRIPT_PREFIXES: &[&str] = &[
    "https://cdn.jsdelivr.net/npm/mathjax",
    "https://polyfill.io/",
];

/// Ids of the script elements this pass itself injects.
const INJECTED_SCRIPT_IDS: &[&str] = &["MathJax-script", "mathjax-config"];

/// MathJax configuration enabling inline `\( \)`, display `\[ \]`, and
/// dollar-pair delimiters.
const MATHJAX_CONFIG: &str = r#"
window.MathJax = {
  tex: {
    inlineMath: [['$', '$'], ['\\(', '\\)']],
    displayMath: [['$$', '$$'], ['\\[', '\\]']],
    processEscapes: true,
    processEnvironments: true
  },
  options: {
    skipHtmlTags: ['script', 'noscript', 'style', 'textarea', 'pre']
  },
  svg: { fontCache: 'global' }
};
"#;

const MATHJAX_SRC: &str = "https://cdn.jsdelivr.net/npm/mathjax@3/es5/tex-mml-chtml.js";

/// Drops every `script` element that is neither the injected renderer nor
/// sourced from a known-safe prefix. Returns how many were removed.
pub fn strip_unsafe_scripts(doc: &NodeRef) -> usize {
    let mut removed = 0;
    for script in dom::select_all(doc, "script") {
        if let Some(id) = dom::attr(&script, "id") {
            if INJECTED_SCRIPT_IDS.contains(&id.as_str()) {
                continue;
            }
        }
        let safe_src = dom::attr(&script, "src")
            .is_some_and(|src| SAFE_SCRIPT_PREFIXES.iter().any(|p| src.starts_with(p)));
        if safe_src {
            continue;
        }
        script.detach();
        removed += 1;
    }
    removed
}

/// Adds the MathJax configuration block and loader script once.
pub fn ensure_math_renderer(doc: &NodeRef) -> bool {
    let Some(head) = dom::select_first(doc, "head") else {
        return false;
    };
    if dom::select_first(doc, "script#MathJax-script").is_some() {
        return false;
    }

    let config = dom::make_element("script", &[("id", "mathjax-config")]);
    config.append(NodeRef::new_text(MATHJAX_CONFIG));
    head.append(config);

    let loader = dom::make_element(
        "script",
        &[("id", "MathJax-script"), ("async", ""), ("src", MATHJAX_SRC)],
    );
    head.append(loader);
    true
}

/// Adds the responsive viewport meta tag once.
pub fn ensure_viewport(doc: &NodeRef) -> bool {
    let Some(head) = dom::select_first(doc, "head") else {
        return false;
    };
    if dom::select_first(doc, "meta[name=viewport]").is_some() {
        return false;
    }
    head.append(dom::make_element(
        "meta",
        &[
            ("name", "viewport"),
            ("content", "width=device-width, initial-scale=1.0"),
        ],
    ));
    true
}

/// Guarantees a `lang` attribute on the root element.
pub fn ensure_lang(doc: &NodeRef) -> bool {
    let Some(html) = dom::select_first(doc, "html") else {
        return false;
    };
    if dom::attr(&html, "lang").is_some_and(|l| !l.is_empty()) {
        return false;
    }
    dom::set_attr(&html, "lang", "en");
    true
}
