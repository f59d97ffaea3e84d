//! Injected page scripts.
//!
//! Role and accessible-name computation is shared between the aria snapshot
//! and the locator runtime so that `(role, name, nth)` triples resolved from
//! a snapshot line always address the same element the snapshot described.

/// Shared helpers: role mapping, accessible name, and the locator itself.
///
/// `spec` is either `{css: "..."}` or `{role, name, nth}`. Traversal is DOM
/// pre-order, matching the snapshot emission order.
pub const HELPERS_JS: &str = r#"
const __norm = (s) => (s || '').replace(/\s+/g, ' ').trim();

const __roleOf = (el) => {
    const explicit = el.getAttribute && el.getAttribute('role');
    if (explicit) return explicit.toLowerCase();
    const tag = el.tagName ? el.tagName.toLowerCase() : '';
    switch (tag) {
        case 'a': return el.href ? 'link' : null;
        case 'button': return 'button';
        case 'select': return 'combobox';
        case 'textarea': return 'textbox';
        case 'option': return 'option';
        case 'nav': return 'navigation';
        case 'main': return 'main';
        case 'form': return 'form';
        case 'img': return 'img';
        case 'ul': case 'ol': return 'list';
        case 'li': return 'listitem';
        case 'table': return 'table';
        case 'h1': case 'h2': case 'h3': case 'h4': case 'h5': case 'h6':
            return 'heading';
        case 'input': {
            switch ((el.type || 'text').toLowerCase()) {
                case 'checkbox': return 'checkbox';
                case 'radio': return 'radio';
                case 'range': return 'slider';
                case 'number': return 'spinbutton';
                case 'search': return 'searchbox';
                case 'submit': case 'button': case 'reset': case 'image':
                    return 'button';
                case 'hidden': return null;
                default: return 'textbox';
            }
        }
        default: return null;
    }
};

const __nameOf = (el) => {
    const aria = el.getAttribute && el.getAttribute('aria-label');
    if (aria) return __norm(aria);
    const labelledby = el.getAttribute && el.getAttribute('aria-labelledby');
    if (labelledby) {
        const parts = labelledby.split(/\s+/)
            .map((id) => { const t = document.getElementById(id); return t ? t.innerText || t.textContent : ''; });
        const joined = __norm(parts.join(' '));
        if (joined) return joined;
    }
    if (el.labels && el.labels.length) {
        const joined = __norm(Array.from(el.labels).map((l) => l.innerText).join(' '));
        if (joined) return joined;
    }
    if (el.alt) return __norm(el.alt);
    if (el.placeholder) return __norm(el.placeholder);
    if (el.title) return __norm(el.title);
    if (el.value && (el.tagName === 'INPUT' || el.tagName === 'BUTTON')) return __norm(el.value);
    let text = el.innerText || el.textContent || '';
    text = __norm(text);
    if (text.length > 120) text = text.substring(0, 120);
    return text;
};

const __locate = (spec) => {
    if (spec.css) return document.querySelector(spec.css);
    let i = 0;
    const walker = document.createTreeWalker(document.body, NodeFilter.SHOW_ELEMENT);
    for (let el = walker.currentNode; el; el = walker.nextNode()) {
        if (el === document.body) continue;
        const role = __roleOf(el);
        if (role !== spec.role) continue;
        if (__norm(__nameOf(el)) !== spec.name) continue;
        if (i === spec.nth) return el;
        i += 1;
    }
    return null;
};

const __isVisible = (el) => {
    if (!el) return false;
    const rect = el.getBoundingClientRect();
    const style = getComputedStyle(el);
    return rect.width > 0 && rect.height > 0
        && style.visibility !== 'hidden'
        && style.display !== 'none'
        && parseFloat(style.opacity) > 0;
};
"#;

/// Serialize the body subtree as an indented aria tree.
///
/// Output lines look like `- button "Submit"`; nodes with no computed role
/// contribute only their children. Depth is DOM depth, two spaces per level.
pub const ARIA_SNAPSHOT_JS: &str = r#"
(() => {
    %HELPERS%
    const lines = [];
    const visit = (el, depth) => {
        const role = __roleOf(el);
        let next = depth;
        if (role) {
            const name = __nameOf(el);
            const indent = '  '.repeat(depth);
            lines.push(name ? `${indent}- ${role} "${name.replace(/"/g, '\\"')}"` : `${indent}- ${role}`);
            next = depth + 1;
        }
        for (const child of el.children) visit(child, next);
    };
    if (document.body) {
        for (const child of document.body.children) visit(child, 0);
    }
    return lines.join('\n');
})()
"#;

/// `__locate` the spec and report a visibility-checked bounding box.
pub const BOUNDING_BOX_JS: &str = r#"
(() => {
    %HELPERS%
    const el = __locate(%SPEC%);
    if (!el) return null;
    const rect = el.getBoundingClientRect();
    return { x: rect.x, y: rect.y, width: rect.width, height: rect.height };
})()
"#;

pub const IS_VISIBLE_JS: &str = r#"
(() => {
    %HELPERS%
    return __isVisible(__locate(%SPEC%));
})()
"#;

pub const SCROLL_INTO_VIEW_JS: &str = r#"
(() => {
    %HELPERS%
    const el = __locate(%SPEC%);
    if (!el) return false;
    el.scrollIntoView({ behavior: 'instant', block: 'center' });
    return true;
})()
"#;

/// Forced click: bypass hit-testing with a direct DOM click.
pub const FORCE_CLICK_JS: &str = r#"
(() => {
    %HELPERS%
    const el = __locate(%SPEC%);
    if (!el) return false;
    el.click();
    return true;
})()
"#;

/// Fill an input/textarea/contenteditable, optionally clearing first, and
/// fire the events frameworks listen for.
pub const FILL_JS: &str = r#"
(() => {
    %HELPERS%
    const el = __locate(%SPEC%);
    if (!el) return false;
    el.focus();
    const text = %TEXT%;
    const clear = %CLEAR%;
    if (el.isContentEditable) {
        if (clear) el.textContent = '';
        el.textContent += text;
    } else {
        if (clear) el.value = '';
        el.value += text;
    }
    el.dispatchEvent(new Event('input', { bubbles: true }));
    el.dispatchEvent(new Event('change', { bubbles: true }));
    return true;
})()
"#;

/// Scroll an element (absolute or relative) and report its scroll metrics.
pub const SCROLL_ELEMENT_JS: &str = r#"
(() => {
    %HELPERS%
    const el = __locate(%SPEC%);
    if (!el) return null;
    const req = %REQ%;
    if (req.to) {
        el.scrollTo({ top: req.to.top, left: req.to.left, behavior: 'instant' });
    } else {
        el.scrollBy({ top: req.by.deltaY, left: req.by.deltaX, behavior: 'instant' });
    }
    return {
        scrollTop: el.scrollTop,
        scrollLeft: el.scrollLeft,
        scrollWidth: el.scrollWidth,
        scrollHeight: el.scrollHeight,
        clientWidth: el.clientWidth,
        clientHeight: el.clientHeight
    };
})()
"#;

/// Fetch a URL from inside the page and return the body as base64.
pub const FETCH_JS: &str = r#"
(async () => {
    const resp = await fetch(%URL%, { credentials: 'include' });
    const buf = await resp.arrayBuffer();
    let binary = '';
    const bytes = new Uint8Array(buf);
    const chunk = 0x8000;
    for (let i = 0; i < bytes.length; i += chunk) {
        binary += String.fromCharCode.apply(null, bytes.subarray(i, i + chunk));
    }
    return {
        status: resp.status,
        contentType: resp.headers.get('content-type'),
        base64: btoa(binary)
    };
})()
"#;

/// Splice the shared helpers and a locator spec into a script template.
pub fn with_spec(template: &str, spec_json: &str) -> String {
    template
        .replace("%HELPERS%", HELPERS_JS)
        .replace("%SPEC%", spec_json)
}
