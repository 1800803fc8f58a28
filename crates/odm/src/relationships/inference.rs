//! Naming Inference - Conventions for deriving type names, collection names
//! and key fields from association declarations

const IRREGULARS: &[(&str, &str)] = &[
    ("person", "people"),
    ("child", "children"),
    ("man", "men"),
    ("woman", "women"),
];

/// Swap an irregular last word (`sales_person` -> `sales_people`)
fn irregular(name: &str, to_plural: bool) -> Option<String> {
    let (prefix, last) = match name.rfind('_') {
        Some(pos) => name.split_at(pos + 1),
        None => ("", name),
    };
    IRREGULARS.iter().find_map(|&(singular, plural)| {
        let (from, to) = if to_plural { (singular, plural) } else { (plural, singular) };
        (last == from).then(|| format!("{}{}", prefix, to))
    })
}

/// Simple pluralization (English-centric)
pub fn pluralize(name: &str) -> String {
    if let Some(plural) = irregular(name, true) {
        plural
    } else if name.ends_with('y')
        && !name.ends_with("ay")
        && !name.ends_with("ey")
        && !name.ends_with("iy")
        && !name.ends_with("oy")
        && !name.ends_with("uy")
    {
        format!("{}ies", &name[..name.len() - 1])
    } else if name.ends_with('s')
        || name.ends_with("sh")
        || name.ends_with("ch")
        || name.ends_with('x')
        || name.ends_with('z')
    {
        format!("{}es", name)
    } else {
        format!("{}s", name)
    }
}

/// Simple singularization (English-centric)
pub fn singularize(name: &str) -> String {
    if let Some(singular) = irregular(name, false) {
        singular
    } else if name.ends_with("ies") && name.len() > 3 {
        format!("{}y", &name[..name.len() - 3])
    } else if name.ends_with("sses")
        || name.ends_with("ches")
        || name.ends_with("shes")
        || name.ends_with("xes")
        || name.ends_with("zes")
    {
        name[..name.len() - 2].to_string()
    } else if name.ends_with('s') && !name.ends_with("ss") && name.len() > 1 {
        name[..name.len() - 1].to_string()
    } else {
        name.to_string()
    }
}

/// Convert snake_case to PascalCase
pub fn to_pascal_case(s: &str) -> String {
    s.split('_')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let mut chars = part.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect()
}

/// Convert PascalCase (optionally `::`-namespaced) to snake_case
pub fn to_snake_case(s: &str) -> String {
    let base = s.rsplit("::").next().unwrap_or(s);
    let mut result = String::with_capacity(base.len() + 4);
    for (i, c) in base.chars().enumerate() {
        if c.is_uppercase() {
            if i > 0 {
                result.push('_');
            }
            result.extend(c.to_lowercase());
        } else {
            result.push(c);
        }
    }
    result
}

/// Infer a target type name from an association name (`blue_eyes` -> `BlueEye`)
pub fn classify(association_name: &str) -> String {
    to_pascal_case(&singularize(association_name))
}

/// Infer a collection name from a type name (`EyeBowl` -> `eye_bowls`)
pub fn tableize(type_name: &str) -> String {
    pluralize(&to_snake_case(type_name))
}
