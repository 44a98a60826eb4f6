//! 应用目录：应用名 -> 包名
//!
//! 内置常见应用，可由配置 [apps] 扩展。查找顺序：原样、去空白、小写；都未命中时原样返回（视为包名）。

use std::collections::HashMap;

const BUILTIN_APPS: &[(&str, &str)] = &[
    ("微信", "com.tencent.mm"),
    ("QQ", "com.tencent.mobileqq"),
    ("微博", "com.sina.weibo"),
    ("淘宝", "com.taobao.taobao"),
    ("京东", "com.jingdong.app.mall"),
    ("拼多多", "com.xunmeng.pinduoduo"),
    ("小红书", "com.xingin.xhs"),
    ("豆瓣", "com.douban.frodo"),
    ("知乎", "com.zhihu.android"),
    ("高德地图", "com.autonavi.minimap"),
    ("高德", "com.autonavi.minimap"),
    ("百度地图", "com.baidu.BaiduMap"),
    ("美团", "com.sankuai.meituan"),
    ("大众点评", "com.dianping.v1"),
    ("饿了么", "me.ele"),
    ("携程", "ctrip.android.view"),
    ("12306", "com.MobileTicket"),
    ("滴滴出行", "com.sdu.didi.psnger"),
    ("滴滴", "com.sdu.didi.psnger"),
    ("bilibili", "tv.danmaku.bili"),
    ("哔哩哔哩", "tv.danmaku.bili"),
    ("b站", "tv.danmaku.bili"),
    ("抖音", "com.ss.android.ugc.aweme"),
    ("快手", "com.smile.gifmaker"),
    ("网易云音乐", "com.netease.cloudmusic"),
    ("QQ音乐", "com.tencent.qqmusic"),
    ("设置", "com.android.settings"),
    ("settings", "com.android.settings"),
    ("相机", "com.android.camera"),
    ("camera", "com.android.camera"),
    ("chrome", "com.android.chrome"),
    ("gmail", "com.google.android.gm"),
    ("google maps", "com.google.android.apps.maps"),
    ("youtube", "com.google.android.youtube"),
];

#[derive(Debug, Clone)]
pub struct AppCatalog {
    packages: HashMap<String, String>,
}

impl Default for AppCatalog {
    fn default() -> Self {
        Self {
            packages: BUILTIN_APPS
                .iter()
                .map(|(label, pkg)| (label.to_string(), pkg.to_string()))
                .collect(),
        }
    }
}

impl AppCatalog {
    /// 内置表 + 额外映射（额外映射覆盖同名内置项）
    pub fn with_extra(extra: &HashMap<String, String>) -> Self {
        let mut catalog = Self::default();
        for (label, pkg) in extra {
            catalog.packages.insert(label.clone(), pkg.clone());
        }
        catalog
    }

    pub fn lookup(&self, label: &str) -> Option<&str> {
        let trimmed = label.trim();
        let lowered = trimmed.to_lowercase();
        self.packages
            .get(label)
            .or_else(|| self.packages.get(trimmed))
            .or_else(|| self.packages.get(&lowered))
            .map(String::as_str)
    }

    /// 解析为包名；未收录时返回去空白后的原文
    pub fn resolve(&self, label: &str) -> String {
        self.lookup(label)
            .map(str::to_string)
            .unwrap_or_else(|| label.trim().to_string())
    }

    pub fn len(&self) -> usize {
        self.packages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_order() {
        let catalog = AppCatalog::default();
        assert_eq!(catalog.resolve("微信"), "com.tencent.mm");
        assert_eq!(catalog.resolve("  微信 "), "com.tencent.mm");
        assert_eq!(catalog.resolve("Settings"), "com.android.settings");
        assert_eq!(catalog.resolve(" com.example.app "), "com.example.app");
    }

    #[test]
    fn test_extra_overrides_builtin() {
        let mut extra = HashMap::new();
        extra.insert("设置".to_string(), "com.vendor.settings".to_string());
        let catalog = AppCatalog::with_extra(&extra);
        assert_eq!(catalog.resolve("设置"), "com.vendor.settings");
    }
}
